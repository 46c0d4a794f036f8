// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The object registry (§4.2): clients, objects, object-types and the
//! subscription graph between objects.
//!
//! Cross-references are ids looked up through the maps below, never owning
//! pointers (§9 "cyclic references") — the one exception is an object-type,
//! which is shared via `Rc<ObjectType>` so its own strong count *is* the
//! refcount the original tracks by hand in `obj->type->refcount`. A type
//! drops out of `Registry::types` the moment its count falls back to one
//! (only the registry's own slot left), which is exactly when the original
//! frees it.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::id::IdAllocator;
use crate::wire::attr::Value;
use crate::wire::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

/// One argument's declared wire type, carried opaquely — the broker forwards
/// method schemas for discovery purposes (LOOKUP) but never validates INVOKE
/// arguments against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgType(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub args: BTreeMap<String, ArgType>,
}

#[derive(Debug)]
pub struct ObjectType {
    pub id: TypeId,
    pub methods: Vec<Method>,
}

type InternalHandler = Box<dyn FnMut(&str, Option<&Value>) -> (StatusCode, Option<Value>)>;

pub struct Object {
    pub id: ObjectId,
    pub path: Option<String>,
    pub owner: Option<ClientId>,
    pub object_type: Rc<ObjectType>,
    /// Objects subscribed to this one (incoming edges).
    watchers: Vec<ObjectId>,
    /// Objects this one has subscribed to (outgoing edges).
    watching: Vec<ObjectId>,
    /// Bumped for NOTIFY(active) and UNSUBSCRIBE-on-free frames the broker
    /// originates on this object's behalf, which have no request `seq` to
    /// echo (§3 SUPPLEMENT).
    invoke_seq: u16,
}

impl Object {
    pub fn is_internal(&self) -> bool {
        self.owner.is_none()
    }

    pub fn has_watchers(&self) -> bool {
        !self.watchers.is_empty()
    }

    pub fn watchers(&self) -> &[ObjectId] {
        &self.watchers
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.invoke_seq;
        self.invoke_seq = self.invoke_seq.wrapping_add(1);
        seq
    }
}

/// A NOTIFY(active=...) the registry owes to `target`'s owner. Internal
/// objects (no owner) never generate one since nothing is listening.
pub struct ActiveChanged {
    pub target: ObjectId,
    pub owner: ClientId,
    pub active: bool,
    pub seq: u16,
}

/// An UNSUBSCRIBE the registry owes to a surviving subscriber because the
/// object it was watching was just freed.
pub struct ForcedUnsubscribe {
    pub subscriber: ObjectId,
    pub owner: ClientId,
    pub target: ObjectId,
    pub seq: u16,
}

#[derive(Default)]
pub struct FreeObjectOutcome {
    pub freed_type: Option<TypeId>,
    pub forced_unsubscribes: Vec<ForcedUnsubscribe>,
    pub active_changes: Vec<ActiveChanged>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    PathTaken,
    NotFound,
    NotOwner,
    NotAWatcher,
}

impl RegistryError {
    pub fn status(self) -> StatusCode {
        match self {
            RegistryError::PathTaken => StatusCode::InvalidArgument,
            RegistryError::NotFound => StatusCode::NotFound,
            RegistryError::NotOwner => StatusCode::PermissionDenied,
            RegistryError::NotAWatcher => StatusCode::NotFound,
        }
    }
}

#[derive(Default)]
pub struct Registry {
    client_ids: IdAllocator,
    object_ids: IdAllocator,
    type_ids: IdAllocator,

    clients: HashMap<ClientId, Vec<ObjectId>>,
    objects: HashMap<ObjectId, Object>,
    types: HashMap<TypeId, Rc<ObjectType>>,
    path_index: BTreeMap<String, ObjectId>,
    internal_handlers: HashMap<ObjectId, InternalHandler>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    // --- clients ---------------------------------------------------------

    pub fn create_client(&mut self) -> ClientId {
        let id = ClientId(self.client_ids.allocate().expect("client id space exhausted"));
        self.clients.insert(id, Vec::new());
        id
    }

    /// Frees every object owned by `client`, then the client id itself.
    /// Returns the cumulative registry-side notifications those object
    /// frees produced, in object-free order.
    pub fn free_client(&mut self, client: ClientId) -> Vec<FreeObjectOutcome> {
        let owned = self.clients.remove(&client).unwrap_or_default();
        self.client_ids.free(client.0);

        owned
            .into_iter()
            .map(|obj| self.free_object_unchecked(obj))
            .collect()
    }

    // --- object-types ------------------------------------------------------

    fn intern_new_type(&mut self, methods: Vec<Method>) -> Rc<ObjectType> {
        let id = TypeId(self.type_ids.allocate().expect("type id space exhausted"));
        let ty = Rc::new(ObjectType { id, methods });
        self.types.insert(id, Rc::clone(&ty));
        ty
    }

    fn lookup_type(&self, id: TypeId) -> Option<Rc<ObjectType>> {
        self.types.get(&id).map(Rc::clone)
    }

    /// Drops the registry's own slot for `id` once nothing else references
    /// it. Returns `Some(id)` iff that happened (the object-type is gone).
    fn release_type(&mut self, ty: Rc<ObjectType>) -> Option<TypeId> {
        let id = ty.id;
        drop(ty);
        let still_referenced = self.types.get(&id).map_or(false, |rc| Rc::strong_count(rc) > 1);
        if still_referenced {
            None
        } else {
            self.types.remove(&id);
            self.type_ids.free(id.0);
            Some(id)
        }
    }

    // --- objects -----------------------------------------------------------

    /// See spec §4.2 `create_object`. `signature` takes precedence over
    /// `object_type` when both are present (the former always mints a new
    /// type; the latter only ever reuses one). Returns the new object id,
    /// its type id, and whether that type was freshly minted — the router
    /// only echoes the type id in an ADD_OBJECT reply when it is new.
    pub fn create_object(
        &mut self,
        owner: Option<ClientId>,
        path: Option<String>,
        signature: Option<Vec<Method>>,
        object_type: Option<TypeId>,
    ) -> Result<(ObjectId, TypeId, bool), RegistryError> {
        if let Some(p) = &path {
            if self.path_index.contains_key(p) {
                return Err(RegistryError::PathTaken);
            }
        }

        let (ty, is_new) = if let Some(methods) = signature {
            (self.intern_new_type(methods), true)
        } else if let Some(tid) = object_type {
            match self.lookup_type(tid) {
                Some(ty) => (ty, false),
                None => return Err(RegistryError::NotFound),
            }
        } else {
            (self.intern_new_type(Vec::new()), true)
        };

        let id = ObjectId(self.object_ids.allocate().expect("object id space exhausted"));
        if let Some(p) = &path {
            self.path_index.insert(p.clone(), id);
        }
        if let Some(owner) = owner {
            self.clients.entry(owner).or_default().push(id);
        }

        let type_id = ty.id;
        self.objects.insert(
            id,
            Object {
                id,
                path,
                owner,
                object_type: ty,
                watchers: Vec::new(),
                watching: Vec::new(),
                invoke_seq: 0,
            },
        );

        Ok((id, type_id, is_new))
    }

    pub fn add_internal_object(
        &mut self,
        path: Option<&str>,
        methods: Vec<Method>,
        handler: impl FnMut(&str, Option<&Value>) -> (StatusCode, Option<Value>) + 'static,
    ) -> ObjectId {
        let (id, _, _) = self
            .create_object(None, path.map(String::from), Some(methods), None)
            .expect("built-in object paths must not collide");
        self.internal_handlers.insert(id, Box::new(handler));
        id
    }

    pub fn find_object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    /// Whether `id` still names a connected client — used by the router to
    /// validate a claimed peer before routing a STATUS/DATA reply to it
    /// (§5 "any STATUS/DATA later arriving for it is dropped silently").
    pub fn client_exists(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// `prefix` ending in `*` enumerates every live object whose path
    /// starts with the literal prefix (a lexicographic range scan from the
    /// prefix's lower bound); otherwise it is an exact match. `None`
    /// enumerates every object that has a path at all (§4.5 LOOKUP).
    pub fn lookup_path(&self, prefix: Option<&str>) -> Vec<ObjectId> {
        match prefix {
            None => self.path_index.values().copied().collect(),
            Some(p) => match p.strip_suffix('*') {
                Some(literal) => self
                    .path_index
                    .range(literal.to_string()..)
                    .take_while(|(path, _)| path.starts_with(literal))
                    .map(|(_, id)| *id)
                    .collect(),
                None => self.path_index.get(p).copied().into_iter().collect(),
            },
        }
    }

    /// Fails `NotOwner` if `requester` doesn't own `id` — callers must run
    /// that check themselves (via [`Registry::find_object`]) before a
    /// disconnect-triggered free, where there is no requester to check
    /// against; see [`Registry::free_client`].
    pub fn free_object(&mut self, id: ObjectId, requester: ClientId) -> Result<FreeObjectOutcome, RegistryError> {
        let owner = self.objects.get(&id).ok_or(RegistryError::NotFound)?.owner;
        if owner != Some(requester) {
            return Err(RegistryError::NotOwner);
        }
        if let Some(owner) = owner {
            if let Some(objs) = self.clients.get_mut(&owner) {
                objs.retain(|o| *o != id);
            }
        }
        Ok(self.free_object_unchecked(id))
    }

    fn free_object_unchecked(&mut self, id: ObjectId) -> FreeObjectOutcome {
        let mut outcome = FreeObjectOutcome::default();

        let removed = match self.objects.remove(&id) {
            Some(obj) => obj,
            None => return outcome,
        };
        self.object_ids.free(id.0);

        if let Some(path) = &removed.path {
            self.path_index.remove(path);
        }
        self.internal_handlers.remove(&id);

        // Incoming edges: tell every surviving subscriber it has been
        // force-unsubscribed, and remove the corresponding outgoing edge on
        // their side.
        for subscriber_id in removed.watchers {
            if let Some(subscriber) = self.objects.get_mut(&subscriber_id) {
                subscriber.watching.retain(|t| *t != id);
                if let Some(owner) = subscriber.owner {
                    outcome.forced_unsubscribes.push(ForcedUnsubscribe {
                        subscriber: subscriber_id,
                        owner,
                        target: id,
                        seq: subscriber.next_seq(),
                    });
                }
            }
        }

        // Outgoing edges: remove this object from whatever it was watching;
        // tell that target's owner if its subscriber list just went empty.
        for target_id in removed.watching {
            if let Some(target) = self.objects.get_mut(&target_id) {
                target.watchers.retain(|s| *s != id);
                if target.watchers.is_empty() {
                    if let Some(owner) = target.owner {
                        outcome.active_changes.push(ActiveChanged {
                            target: target_id,
                            owner,
                            active: false,
                            seq: target.next_seq(),
                        });
                    }
                }
            }
        }

        outcome.freed_type = self.release_type(removed.object_type);
        outcome
    }

    // --- subscriptions -------------------------------------------------

    pub fn subscribe(&mut self, subscriber: ObjectId, target: ObjectId) -> Result<Option<ActiveChanged>, RegistryError> {
        if subscriber == target {
            return Err(RegistryError::NotFound);
        }
        if !self.objects.contains_key(&subscriber) {
            return Err(RegistryError::NotFound);
        }

        let was_empty = {
            let target_obj = self.objects.get(&target).ok_or(RegistryError::NotFound)?;
            target_obj.watchers.is_empty()
        };

        self.objects.get_mut(&subscriber).unwrap().watching.push(target);
        let target_obj = self.objects.get_mut(&target).unwrap();
        target_obj.watchers.push(subscriber);

        if was_empty {
            if let Some(owner) = target_obj.owner {
                return Ok(Some(ActiveChanged { target, owner, active: true, seq: target_obj.next_seq() }));
            }
        }
        Ok(None)
    }

    pub fn unsubscribe(&mut self, subscriber: ObjectId, target: ObjectId) -> Result<Option<ActiveChanged>, RegistryError> {
        let had_edge = self
            .objects
            .get(&subscriber)
            .map_or(false, |s| s.watching.contains(&target));
        if !had_edge {
            return Err(RegistryError::NotAWatcher);
        }

        self.objects.get_mut(&subscriber).unwrap().watching.retain(|t| *t != target);
        let target_obj = self.objects.get_mut(&target).ok_or(RegistryError::NotFound)?;
        target_obj.watchers.retain(|s| *s != subscriber);

        if target_obj.watchers.is_empty() {
            if let Some(owner) = target_obj.owner {
                return Ok(Some(ActiveChanged { target, owner, active: false, seq: target_obj.next_seq() }));
            }
        }
        Ok(None)
    }

    // --- internal (built-in) objects ------------------------------------

    pub fn invoke_internal(&mut self, id: ObjectId, method: &str, data: Option<&Value>) -> Option<(StatusCode, Option<Value>)> {
        self.internal_handlers.get_mut(&id).map(|h| h(method, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(name: &str) -> Method {
        Method { name: name.to_string(), args: BTreeMap::new() }
    }

    #[test]
    fn path_must_be_unique() {
        let mut reg = Registry::new();
        let owner = reg.create_client();
        reg.create_object(Some(owner), Some("a.b".into()), None, None).unwrap();
        let err = reg.create_object(Some(owner), Some("a.b".into()), None, None).unwrap_err();
        assert_eq!(RegistryError::PathTaken, err);
    }

    #[test]
    fn signature_always_mints_a_fresh_type() {
        let mut reg = Registry::new();
        let owner = reg.create_client();
        let (_, t1, new1) = reg.create_object(Some(owner), None, Some(vec![m("foo")]), None).unwrap();
        let (_, t2, new2) = reg.create_object(Some(owner), None, Some(vec![m("bar")]), None).unwrap();
        assert!(new1 && new2);
        assert_ne!(t1, t2);
    }

    #[test]
    fn object_type_reuse_bumps_and_drops_refcount() {
        let mut reg = Registry::new();
        let owner = reg.create_client();
        let (obj_a, ty, is_new) = reg.create_object(Some(owner), None, Some(vec![m("foo")]), None).unwrap();
        assert!(is_new);
        let (obj_b, ty2, is_new2) = reg.create_object(Some(owner), None, None, Some(ty)).unwrap();
        assert!(!is_new2);
        assert_eq!(ty, ty2);

        let outcome_a = reg.free_object(obj_a, owner).unwrap();
        assert_eq!(None, outcome_a.freed_type, "type is still referenced by obj_b");

        let outcome_b = reg.free_object(obj_b, owner).unwrap();
        assert_eq!(Some(ty), outcome_b.freed_type);
    }

    #[test]
    fn lookup_path_prefix_and_exact() {
        let mut reg = Registry::new();
        let owner = reg.create_client();
        let (a, _, _) = reg.create_object(Some(owner), Some("a.b".into()), None, None).unwrap();
        let (c, _, _) = reg.create_object(Some(owner), Some("a.c".into()), None, None).unwrap();
        reg.create_object(Some(owner), Some("z".into()), None, None).unwrap();

        let mut prefixed = reg.lookup_path(Some("a.*"));
        prefixed.sort_by_key(|o| o.0);
        let mut expected = vec![a, c];
        expected.sort_by_key(|o| o.0);
        assert_eq!(expected, prefixed);

        assert_eq!(vec![a], reg.lookup_path(Some("a.b")));
        assert_eq!(Vec::<ObjectId>::new(), reg.lookup_path(Some("nope")));
    }

    #[test]
    fn subscribe_notifies_only_on_the_empty_to_nonempty_transition() {
        let mut reg = Registry::new();
        let owner_a = reg.create_client();
        let owner_b = reg.create_client();
        let (target, _, _) = reg.create_object(Some(owner_a), None, None, None).unwrap();
        let (sub1, _, _) = reg.create_object(Some(owner_b), None, None, None).unwrap();
        let (sub2, _, _) = reg.create_object(Some(owner_b), None, None, None).unwrap();

        let first = reg.subscribe(sub1, target).unwrap();
        assert!(first.is_some());
        assert!(first.unwrap().active);

        let second = reg.subscribe(sub2, target).unwrap();
        assert!(second.is_none(), "already had a watcher, no transition");
    }

    #[test]
    fn freeing_watched_object_forces_unsubscribe_of_survivors() {
        let mut reg = Registry::new();
        let owner_a = reg.create_client();
        let owner_b = reg.create_client();
        let (target, _, _) = reg.create_object(Some(owner_a), None, None, None).unwrap();
        let (sub, _, _) = reg.create_object(Some(owner_b), None, None, None).unwrap();
        reg.subscribe(sub, target).unwrap();

        let outcome = reg.free_object(target, owner_a).unwrap();
        assert_eq!(1, outcome.forced_unsubscribes.len());
        assert_eq!(sub, outcome.forced_unsubscribes[0].subscriber);
        assert_eq!(owner_b, outcome.forced_unsubscribes[0].owner);
    }

    #[test]
    fn freeing_watcher_deactivates_target_when_it_was_the_last_one() {
        let mut reg = Registry::new();
        let owner_a = reg.create_client();
        let owner_b = reg.create_client();
        let (target, _, _) = reg.create_object(Some(owner_a), None, None, None).unwrap();
        let (sub, _, _) = reg.create_object(Some(owner_b), None, None, None).unwrap();
        reg.subscribe(sub, target).unwrap();

        let outcome = reg.free_object(sub, owner_b).unwrap();
        assert_eq!(1, outcome.active_changes.len());
        assert!(!outcome.active_changes[0].active);
        assert_eq!(target, outcome.active_changes[0].target);
    }

    #[test]
    fn free_object_requires_ownership() {
        let mut reg = Registry::new();
        let owner = reg.create_client();
        let other = reg.create_client();
        let (obj, _, _) = reg.create_object(Some(owner), None, None, None).unwrap();
        assert_eq!(RegistryError::NotOwner, reg.free_object(obj, other).unwrap_err());
    }

    #[test]
    fn freeing_an_object_returns_its_id_for_reuse() {
        let mut reg = Registry::new();
        let owner = reg.create_client();

        // Repeatedly create-then-free a single object's worth of churn;
        // if the object id space leaked, `object_ids.len()` would grow
        // without bound instead of staying at zero between rounds.
        for _ in 0..10_000 {
            let (obj, _, _) = reg.create_object(Some(owner), None, None, None).unwrap();
            reg.free_object(obj, owner).unwrap();
        }

        assert_eq!(0, reg.object_ids.len(), "freed object ids must be returned to the allocator");
    }

    #[test]
    fn freeing_the_last_object_of_a_type_returns_its_type_id_for_reuse() {
        let mut reg = Registry::new();
        let owner = reg.create_client();

        for _ in 0..10_000 {
            let (obj, _, _) = reg.create_object(Some(owner), None, Some(vec![m("foo")]), None).unwrap();
            reg.free_object(obj, owner).unwrap();
        }

        assert_eq!(0, reg.type_ids.len(), "freed object-type ids must be returned to the allocator");
    }

    #[test]
    fn internal_object_invoke_runs_in_process() {
        let mut reg = Registry::new();
        let id = reg.add_internal_object(Some("internal.echo"), vec![m("echo")], |method, data| {
            assert_eq!("echo", method);
            (StatusCode::Ok, data.cloned())
        });

        let (status, reply) = reg.invoke_internal(id, "echo", Some(&Value::U32(9))).unwrap();
        assert_eq!(StatusCode::Ok.code(), status.code());
        assert_eq!(Some(Value::U32(9)), reply);
    }
}
