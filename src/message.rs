// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The message buffer (§4.3): a header, a reference-counted payload, and at
//! most one attached fd.
//!
//! The original tracks a manual refcount and a "shared" sentinel so a
//! buffer aliasing the scratch serialization area can't be mutated in
//! place. `Rc<Vec<u8>>` gives the same sharing for free — cloning a
//! `Message` bumps a refcount instead of copying bytes — and `Rc::make_mut`
//! is the copy-on-write fallback for the rare case a sender needs to edit a
//! shared payload. The attached fd is an `OwnedFd`: since a `Message` holds
//! at most one, and `OwnedFd`'s `Drop` closes it, "closed exactly once" is
//! just normal ownership instead of a manual refcount-to-zero dance.

use std::os::fd::OwnedFd;
use std::rc::Rc;

use crate::wire::Header;

pub struct Message {
    pub header: Header,
    payload: Rc<Vec<u8>>,
    fd: Option<OwnedFd>,
}

impl Message {
    pub fn new(header: Header, payload: Vec<u8>) -> Message {
        Message { header, payload: Rc::new(payload), fd: None }
    }

    pub fn with_fd(header: Header, payload: Vec<u8>, fd: OwnedFd) -> Message {
        Message { header, payload: Rc::new(payload), fd: Some(fd) }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        Rc::make_mut(&mut self.payload)
    }

    pub fn has_fd(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd(&self) -> Option<&OwnedFd> {
        self.fd.as_ref()
    }

    /// Closes any attached fd immediately (router step 3, §4.5): every
    /// frame type except STATUS discards an incoming fd up front.
    pub fn close_fd(&mut self) {
        self.fd = None;
    }

    /// Builds a new message that shares this one's payload bytes (a cheap
    /// refcount bump) under a different header and without the fd — used
    /// when fanning the same NOTIFY/INVOKE payload out to several
    /// subscribers (§4.2 `subscribe`, §4.5 NOTIFY).
    pub fn fanout(&self, header: Header) -> Message {
        Message { header, payload: Rc::clone(&self.payload), fd: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameType;

    #[test]
    fn fanout_shares_the_payload_buffer() {
        let msg = Message::new(Header::new(FrameType::Notify, 0, 0), vec![1, 2, 3]);
        let copy = msg.fanout(Header::new(FrameType::Invoke, 1, 2));

        assert_eq!(msg.payload(), copy.payload());
        assert_eq!(2, Rc::strong_count(&msg.payload));
    }

    #[test]
    fn payload_mut_copies_on_write_when_shared() {
        let msg = Message::new(Header::new(FrameType::Data, 0, 0), vec![1, 2, 3]);
        let mut copy = msg.fanout(Header::new(FrameType::Data, 0, 0));

        copy.payload_mut().push(4);

        assert_eq!(msg.payload(), &[1, 2, 3]);
        assert_eq!(copy.payload(), &[1, 2, 3, 4]);
    }
}
