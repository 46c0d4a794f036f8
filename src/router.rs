// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Protocol router (§4.5): decodes control frames, dispatches onto the
//! [`Registry`], and emits replies. Pure logic — the router never touches a
//! socket. Replies are handed to an `out` callback as `(ClientId, Message)`
//! pairs; the event loop owns the client → connection mapping and actually
//! writes them.
//!
//! The match in [`dispatch`] over [`FrameType`] is the "static dense table
//! indexed by frame-type" of §9 — the compiler lowers it to a jump table,
//! and the `None`/unmatched arm is exactly the dispatch table's missing-entry
//! fallback to `INVALID_COMMAND`.

use log::warn;

use crate::message::Message;
use crate::registry::{ClientId, Method, ObjectId, Registry, TypeId};
use crate::wire::attr::{AttrSet, Builder, Value};
use crate::wire::{AttrTag, FrameType, Header, StatusCode};

pub struct Router {
    max_body_len: usize,
}

enum Outcome {
    Status(StatusCode),
    AlreadyHandled,
}

impl Router {
    pub fn new(max_body_len: usize) -> Router {
        Router { max_body_len }
    }

    pub fn max_body_len(&self) -> usize {
        self.max_body_len
    }

    /// Builds the HELLO frame a newly accepted client is greeted with
    /// (§6): peer carries the assigned client id, seq is 0.
    pub fn hello(client: ClientId) -> Message {
        Message::new(Header::new(FrameType::Hello, 0, client.0), Vec::new())
    }

    /// Processes one complete inbound frame from `from`, routing any
    /// replies through `out`.
    pub fn dispatch(&mut self, registry: &mut Registry, from: ClientId, mut frame: Message, out: &mut dyn FnMut(ClientId, Message)) {
        let seq = frame.header.seq;
        let peer = frame.header.peer;
        let frame_type = frame.header.frame_type();

        // fds only matter on STATUS replies returning handles from callees
        // (§4.5 step 3).
        if frame_type != Some(FrameType::Status) {
            frame.close_fd();
        }

        let attrs = match AttrSet::decode(frame.payload()) {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!("malformed frame from client {}: {e}", from.0);
                AttrSet::new()
            }
        };

        let outcome = match frame_type {
            None => Outcome::Status(StatusCode::InvalidCommand),
            Some(FrameType::Ping) => self.handle_ping(&frame, seq, peer, from, out),
            Some(FrameType::AddObject) => self.handle_add_object(registry, &attrs, seq, peer, from, out),
            Some(FrameType::RemoveObject) => self.handle_remove_object(registry, &attrs, seq, peer, from, out),
            Some(FrameType::Lookup) => self.handle_lookup(registry, &attrs, seq, peer, from, out),
            Some(FrameType::Invoke) => self.handle_invoke(registry, &attrs, &frame, from, out),
            Some(FrameType::Status) | Some(FrameType::Data) => {
                self.handle_reply(registry, &attrs, &frame, frame_type.unwrap(), from, out);
                Outcome::AlreadyHandled
            }
            Some(FrameType::Subscribe) => self.handle_subscribe(registry, &attrs, from, out),
            Some(FrameType::Unsubscribe) => self.handle_unsubscribe(registry, &attrs, from, out),
            Some(FrameType::Notify) => self.handle_notify(registry, &attrs, seq, peer, from, out),
            Some(FrameType::Hello) => Outcome::Status(StatusCode::InvalidCommand),
        };

        if let Outcome::Status(status) = outcome {
            let body = Builder::new().put(AttrTag::Status, Value::U32(status.code())).build();
            out(from, Message::new(Header::new(FrameType::Status, seq, peer), body));
        }
    }

    fn handle_ping(
        &self,
        frame: &Message,
        seq: u16,
        peer: u32,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        out(from, frame.fanout(Header::new(FrameType::Data, seq, peer)));
        Outcome::Status(StatusCode::Ok)
    }

    fn handle_add_object(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        seq: u16,
        peer: u32,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        let path = attrs.get(AttrTag::ObjPath).and_then(Value::as_str).map(String::from);
        let signature = attrs.get(AttrTag::Signature).and_then(Value::as_array).map(decode_methods);
        let object_type = attrs.get(AttrTag::ObjType).and_then(Value::as_u32).map(TypeId);

        match registry.create_object(Some(from), path, signature, object_type) {
            Ok((id, type_id, is_new)) => {
                let mut builder = Builder::new().put(AttrTag::ObjId, Value::U32(id.0));
                if is_new {
                    builder = builder.put(AttrTag::ObjType, Value::U32(type_id.0));
                }
                out(from, Message::new(Header::new(FrameType::Data, seq, peer), builder.build()));
                Outcome::Status(StatusCode::Ok)
            }
            Err(e) => Outcome::Status(e.status()),
        }
    }

    fn handle_remove_object(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        seq: u16,
        peer: u32,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        let obj_id = match attrs.get(AttrTag::ObjId).and_then(Value::as_u32) {
            Some(v) => ObjectId(v),
            None => return Outcome::Status(StatusCode::InvalidArgument),
        };

        match registry.free_object(obj_id, from) {
            Ok(outcome) => {
                self.notify_free_outcome(&outcome, out);

                let mut builder = Builder::new().put(AttrTag::ObjId, Value::U32(obj_id.0));
                if let Some(freed_type) = outcome.freed_type {
                    builder = builder.put(AttrTag::ObjType, Value::U32(freed_type.0));
                }
                out(from, Message::new(Header::new(FrameType::Data, seq, peer), builder.build()));
                Outcome::Status(StatusCode::Ok)
            }
            Err(e) => Outcome::Status(e.status()),
        }
    }

    fn handle_lookup(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        seq: u16,
        peer: u32,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        let prefix = attrs.get(AttrTag::ObjPath).and_then(Value::as_str);
        let ids = registry.lookup_path(prefix);

        if ids.is_empty() {
            return Outcome::Status(StatusCode::NotFound);
        }

        for id in ids {
            let object = match registry.find_object(id) {
                Some(o) => o,
                None => continue,
            };

            let mut builder = Builder::new().put(AttrTag::ObjId, Value::U32(object.id.0));
            if let Some(path) = &object.path {
                builder = builder.put(AttrTag::ObjPath, Value::Str(path.clone()));
            }
            builder = builder.put(AttrTag::ObjType, Value::U32(object.object_type.id.0));
            if let Some(owner) = object.owner {
                builder = builder.put(AttrTag::Target, Value::U32(owner.0));
            }
            builder = builder.put(AttrTag::Signature, encode_methods(&object.object_type.methods));

            out(from, Message::new(Header::new(FrameType::Data, seq, peer), builder.build()));
        }

        Outcome::Status(StatusCode::Ok)
    }

    fn handle_invoke(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        frame: &Message,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        let obj_id = match attrs.get(AttrTag::ObjId).and_then(Value::as_u32) {
            Some(v) => ObjectId(v),
            None => return Outcome::Status(StatusCode::InvalidArgument),
        };
        let method = match attrs.get(AttrTag::Method).and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => return Outcome::Status(StatusCode::InvalidArgument),
        };
        let data = attrs.get(AttrTag::Data).cloned();

        let object = match registry.find_object(obj_id) {
            Some(o) => o,
            None => return Outcome::Status(StatusCode::NotFound),
        };

        if object.is_internal() {
            let (status, reply) = registry
                .invoke_internal(obj_id, &method, data.as_ref())
                .unwrap_or((StatusCode::NotFound, None));
            if let Some(reply) = reply {
                let body = Builder::new().put(AttrTag::ObjId, Value::U32(obj_id.0)).put(AttrTag::Data, reply).build();
                out(from, Message::new(Header::new(FrameType::Data, frame.header.seq, frame.header.peer), body));
            }
            return Outcome::Status(status);
        }

        let owner = object.owner.expect("non-internal object always has an owner");
        let body = invoke_body(obj_id, &method, data.as_ref());
        let header = Header::new(FrameType::Invoke, frame.header.seq, from.0);
        out(owner, Message::new(header, body));
        Outcome::AlreadyHandled
    }

    /// STATUS/DATA frames are replies a callee sends back on behalf of the
    /// object it was invoked through (§4.5): the caller never sends its own
    /// STATUS for this frame type, so any failure here means the frame is
    /// dropped on the floor in silence.
    fn handle_reply(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        frame: &Message,
        frame_type: FrameType,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) {
        let obj_id = match attrs.get(AttrTag::ObjId).and_then(Value::as_u32) {
            Some(v) => ObjectId(v),
            None => return,
        };
        if frame_type == FrameType::Status && attrs.get(AttrTag::Status).is_none() {
            return;
        }
        if frame_type == FrameType::Data && attrs.get(AttrTag::Data).is_none() {
            return;
        }

        let object = match registry.find_object(obj_id) {
            Some(o) => o,
            None => return,
        };
        if object.owner != Some(from) {
            return;
        }

        let target = ClientId(frame.header.peer);
        if !registry.client_exists(target) {
            return;
        }

        out(target, frame.fanout(Header::new(frame_type, frame.header.seq, obj_id.0)));
    }

    fn handle_subscribe(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        let (subscriber, target) = match (
            attrs.get(AttrTag::ObjId).and_then(Value::as_u32),
            attrs.get(AttrTag::Target).and_then(Value::as_u32),
        ) {
            (Some(s), Some(t)) => (ObjectId(s), ObjectId(t)),
            _ => return Outcome::Status(StatusCode::InvalidArgument),
        };

        let sub_obj = match registry.find_object(subscriber) {
            Some(o) => o,
            None => return Outcome::Status(StatusCode::NotFound),
        };
        if sub_obj.owner != Some(from) {
            return Outcome::Status(StatusCode::InvalidArgument);
        }
        let target_obj = match registry.find_object(target) {
            Some(o) => o,
            None => return Outcome::Status(StatusCode::NotFound),
        };
        if target_obj.owner == Some(from) {
            return Outcome::Status(StatusCode::InvalidArgument);
        }

        match registry.subscribe(subscriber, target) {
            Ok(changed) => {
                if let Some(ac) = changed {
                    self.notify_active(ac.owner, ac.target, ac.active, ac.seq, out);
                }
                Outcome::Status(StatusCode::Ok)
            }
            Err(e) => Outcome::Status(e.status()),
        }
    }

    fn handle_unsubscribe(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        let (subscriber, target) = match (
            attrs.get(AttrTag::ObjId).and_then(Value::as_u32),
            attrs.get(AttrTag::Target).and_then(Value::as_u32),
        ) {
            (Some(s), Some(t)) => (ObjectId(s), ObjectId(t)),
            _ => return Outcome::Status(StatusCode::InvalidArgument),
        };

        let sub_obj = match registry.find_object(subscriber) {
            Some(o) => o,
            None => return Outcome::Status(StatusCode::NotFound),
        };
        if sub_obj.owner != Some(from) {
            return Outcome::Status(StatusCode::InvalidArgument);
        }

        match registry.unsubscribe(subscriber, target) {
            Ok(changed) => {
                if let Some(ac) = changed {
                    self.notify_active(ac.owner, ac.target, ac.active, ac.seq, out);
                }
                Outcome::Status(StatusCode::Ok)
            }
            Err(e) => Outcome::Status(e.status()),
        }
    }

    fn handle_notify(
        &self,
        registry: &mut Registry,
        attrs: &AttrSet,
        seq: u16,
        peer: u32,
        from: ClientId,
        out: &mut dyn FnMut(ClientId, Message),
    ) -> Outcome {
        let obj_id = match attrs.get(AttrTag::ObjId).and_then(Value::as_u32) {
            Some(v) => ObjectId(v),
            None => return Outcome::Status(StatusCode::InvalidArgument),
        };
        let method = match attrs.get(AttrTag::Method).and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => return Outcome::Status(StatusCode::InvalidArgument),
        };
        let no_reply = attrs.get(AttrTag::NoReply).and_then(Value::as_u8).unwrap_or(0) != 0;
        let data = attrs.get(AttrTag::Data).cloned();

        let object = match registry.find_object(obj_id) {
            Some(o) => o,
            None => return Outcome::Status(StatusCode::NotFound),
        };
        if object.owner != Some(from) {
            return Outcome::Status(StatusCode::PermissionDenied);
        }

        if !no_reply {
            let ids = Value::Array(object.watchers().iter().map(|w| Value::U32(w.0)).collect());
            let body = Builder::new().put(AttrTag::ObjId, Value::U32(obj_id.0)).put(AttrTag::Signature, ids).build();
            out(from, Message::new(Header::new(FrameType::Status, seq, peer), body));
        }

        let watchers: Vec<ObjectId> = object.watchers().to_vec();
        for watcher_id in watchers {
            let watcher = match registry.find_object(watcher_id) {
                Some(w) => w,
                None => continue,
            };
            if let Some(owner) = watcher.owner {
                let body = invoke_body(watcher_id, &method, data.as_ref());
                out(owner, Message::new(Header::new(FrameType::Invoke, seq, from.0), body));
            }
        }

        Outcome::AlreadyHandled
    }

    fn notify_active(&self, owner: ClientId, target: ObjectId, active: bool, seq: u16, out: &mut dyn FnMut(ClientId, Message)) {
        let body = Builder::new()
            .put(AttrTag::ObjId, Value::U32(target.0))
            .put(AttrTag::NoReply, Value::U8(active as u8))
            .build();
        out(owner, Message::new(Header::new(FrameType::Notify, seq, 0), body));
    }

    /// Turns the notifications a [`Registry::free_object`]/`free_client`
    /// outcome owes into actual frames. Used both for REMOVE_OBJECT (above)
    /// and for the event loop's disconnect path, which has no request to
    /// reply to but still owes NOTIFY/UNSUBSCRIBE frames to surviving peers.
    pub fn notify_free_outcome(&self, outcome: &crate::registry::FreeObjectOutcome, out: &mut dyn FnMut(ClientId, Message)) {
        for ac in &outcome.active_changes {
            self.notify_active(ac.owner, ac.target, ac.active, ac.seq, out);
        }
        for fu in &outcome.forced_unsubscribes {
            let body = Builder::new()
                .put(AttrTag::ObjId, Value::U32(fu.subscriber.0))
                .put(AttrTag::Target, Value::U32(fu.target.0))
                .build();
            out(fu.owner, Message::new(Header::new(FrameType::Unsubscribe, fu.seq, 0), body));
        }
    }
}

fn invoke_body(obj_id: ObjectId, method: &str, data: Option<&Value>) -> Vec<u8> {
    let mut builder = Builder::new().put(AttrTag::ObjId, Value::U32(obj_id.0)).put(AttrTag::Method, Value::Str(method.to_string()));
    if let Some(data) = data {
        builder = builder.put(AttrTag::Data, data.clone());
    }
    builder.build()
}

fn decode_methods(entries: &[Value]) -> Vec<Method> {
    entries.iter().filter_map(decode_method).collect()
}

fn decode_method(entry: &Value) -> Option<Method> {
    let table = entry.as_table()?;
    let name = table.iter().find(|(t, _)| *t == 1).and_then(|(_, v)| v.as_str())?.to_string();
    let args = table
        .iter()
        .find(|(t, _)| *t == 2)
        .and_then(|(_, v)| v.as_table())
        .map(decode_args)
        .unwrap_or_default();
    Some(Method { name, args })
}

fn decode_args(entries: &[(u32, Value)]) -> std::collections::BTreeMap<String, crate::registry::ArgType> {
    entries
        .iter()
        .filter_map(|(_, v)| {
            let table = v.as_table()?;
            let name = table.iter().find(|(t, _)| *t == 1).and_then(|(_, v)| v.as_str())?.to_string();
            let ty = table.iter().find(|(t, _)| *t == 2).and_then(|(_, v)| v.as_u32())?;
            Some((name, crate::registry::ArgType(ty)))
        })
        .collect()
}

fn encode_methods(methods: &[Method]) -> Value {
    Value::Array(
        methods
            .iter()
            .map(|m| {
                let args = Value::Table(
                    m.args
                        .iter()
                        .map(|(name, ty)| (0u32, Value::Table(vec![(1, Value::Str(name.clone())), (2, Value::U32(ty.0))])))
                        .collect(),
                );
                Value::Table(vec![(1, Value::Str(m.name.clone())), (2, args)])
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_object(router: &mut Router, registry: &mut Registry, from: ClientId, path: &str, sent: &mut Vec<(ClientId, Message)>) -> ObjectId {
        let body = Builder::new().put(AttrTag::ObjPath, Value::Str(path.into())).build();
        let frame = Message::new(Header::new(FrameType::AddObject, 1, 0), body);
        router.dispatch(registry, from, frame, &mut |c, m| sent.push((c, m)));
        let data = sent.iter().find(|(_, m)| m.header.frame_type() == Some(FrameType::Data)).unwrap();
        let attrs = AttrSet::decode(data.1.payload()).unwrap();
        ObjectId(attrs.get(AttrTag::ObjId).and_then(Value::as_u32).unwrap())
    }

    #[test]
    fn ping_is_echoed_then_acked() {
        let mut router = Router::new(4096);
        let mut registry = Registry::new();
        let from = registry.create_client();
        let body = Builder::new().put(AttrTag::Method, Value::Str("ping".into())).build();
        let frame = Message::new(Header::new(FrameType::Ping, 5, 9), body.clone());

        let mut sent = Vec::new();
        router.dispatch(&mut registry, from, frame, &mut |c, m| sent.push((c, m)));

        assert_eq!(2, sent.len());
        assert_eq!(Some(FrameType::Data), sent[0].1.header.frame_type());
        assert_eq!(body.as_slice(), sent[0].1.payload());
        assert_eq!(5, sent[0].1.header.seq);
        assert_eq!(9, sent[0].1.header.peer);
        assert_eq!(Some(FrameType::Status), sent[1].1.header.frame_type());
    }

    #[test]
    fn unknown_frame_type_gets_invalid_command() {
        let mut router = Router::new(4096);
        let mut registry = Registry::new();
        let from = registry.create_client();
        let mut header = Header::new(FrameType::Ping, 3, 0);
        header.raw_type = 250;
        let frame = Message::new(header, Vec::new());

        let mut sent = Vec::new();
        router.dispatch(&mut registry, from, frame, &mut |c, m| sent.push((c, m)));

        let attrs = AttrSet::decode(sent[0].1.payload()).unwrap();
        assert_eq!(Some(StatusCode::InvalidCommand.code()), attrs.get(AttrTag::Status).and_then(Value::as_u32));
    }

    #[test]
    fn invoke_is_forwarded_to_the_owner_with_sender_as_peer() {
        let mut router = Router::new(4096);
        let mut registry = Registry::new();
        let owner = registry.create_client();
        let caller = registry.create_client();
        let mut sent = Vec::new();
        let obj = add_object(&mut router, &mut registry, owner, "svc", &mut sent);
        sent.clear();

        let body = Builder::new()
            .put(AttrTag::ObjId, Value::U32(obj.0))
            .put(AttrTag::Method, Value::Str("go".into()))
            .build();
        let frame = Message::new(Header::new(FrameType::Invoke, 11, 0), body);
        router.dispatch(&mut registry, caller, frame, &mut |c, m| sent.push((c, m)));

        assert_eq!(1, sent.len(), "invoke-forward is already-handled, no extra STATUS");
        let (to, msg) = &sent[0];
        assert_eq!(owner, *to);
        assert_eq!(Some(FrameType::Invoke), msg.header.frame_type());
        assert_eq!(11, msg.header.seq);
        assert_eq!(caller.0, msg.header.peer);
    }

    #[test]
    fn subscribing_to_your_own_object_is_invalid_argument() {
        let mut router = Router::new(4096);
        let mut registry = Registry::new();
        let owner = registry.create_client();
        let mut sent = Vec::new();
        let a = add_object(&mut router, &mut registry, owner, "a", &mut sent);
        let b = add_object(&mut router, &mut registry, owner, "b", &mut sent);
        sent.clear();

        let body = Builder::new().put(AttrTag::ObjId, Value::U32(a.0)).put(AttrTag::Target, Value::U32(b.0)).build();
        let frame = Message::new(Header::new(FrameType::Subscribe, 1, 0), body);
        router.dispatch(&mut registry, owner, frame, &mut |c, m| sent.push((c, m)));

        let attrs = AttrSet::decode(sent[0].1.payload()).unwrap();
        assert_eq!(Some(StatusCode::InvalidArgument.code()), attrs.get(AttrTag::Status).and_then(Value::as_u32));
    }

    #[test]
    fn notify_forwards_invoke_with_the_requests_own_seq() {
        let mut router = Router::new(4096);
        let mut registry = Registry::new();
        let target_owner = registry.create_client();
        let sub_owner = registry.create_client();
        let mut sent = Vec::new();
        let target = add_object(&mut router, &mut registry, target_owner, "x", &mut sent);
        let subscriber = add_object(&mut router, &mut registry, sub_owner, "y", &mut sent);
        sent.clear();

        let sub_body = Builder::new().put(AttrTag::ObjId, Value::U32(subscriber.0)).put(AttrTag::Target, Value::U32(target.0)).build();
        let sub_frame = Message::new(Header::new(FrameType::Subscribe, 1, 0), sub_body);
        router.dispatch(&mut registry, sub_owner, sub_frame, &mut |c, m| sent.push((c, m)));
        sent.clear();

        let notify_body = Builder::new()
            .put(AttrTag::ObjId, Value::U32(target.0))
            .put(AttrTag::Method, Value::Str("ev".into()))
            .build();
        let notify_frame = Message::new(Header::new(FrameType::Notify, 77, 0), notify_body);
        router.dispatch(&mut registry, target_owner, notify_frame, &mut |c, m| sent.push((c, m)));

        let (to, forwarded) = sent.iter().find(|(_, m)| m.header.frame_type() == Some(FrameType::Invoke)).unwrap();
        assert_eq!(sub_owner, *to);
        assert_eq!(77, forwarded.header.seq, "fan-out must reuse the NOTIFY request's own seq, not 0");
    }

    #[test]
    fn status_reply_is_dropped_silently_when_peer_disconnected() {
        let mut router = Router::new(4096);
        let mut registry = Registry::new();
        let owner = registry.create_client();
        let mut sent = Vec::new();
        let obj = add_object(&mut router, &mut registry, owner, "svc", &mut sent);
        sent.clear();

        let body = Builder::new().put(AttrTag::ObjId, Value::U32(obj.0)).put(AttrTag::Status, Value::U32(0)).build();
        let frame = Message::new(Header::new(FrameType::Status, 1, 999), body);
        router.dispatch(&mut registry, owner, frame, &mut |c, m| sent.push((c, m)));

        assert!(sent.is_empty(), "peer 999 doesn't exist, frame must be dropped with no reply at all");
    }
}
