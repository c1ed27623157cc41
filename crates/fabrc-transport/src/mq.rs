//! Matching of arrived messages to posted receives.
//!
//! Receives match in post order, messages in arrival order. A message with
//! no matching receive waits on the unexpected list; for a rendezvous
//! message only the RTS waits, and the data is pulled once it matches.

use crate::error::Result;
use crate::wire::Epid;
use bytes::Bytes;
use std::collections::VecDeque;

/// A completed receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub src: Epid,
    pub data: Vec<u8>,
}

pub type RecvCallback = Box<dyn FnOnce(Result<Received>) + Send>;

pub struct PostedRecv {
    /// `None` matches any source.
    pub src: Option<Epid>,
    pub capacity: usize,
    pub callback: RecvCallback,
}

impl PostedRecv {
    fn matches(&self, src: Epid) -> bool {
        self.src.map_or(true, |s| s == src)
    }
}

#[derive(Debug, Clone)]
pub enum Unexpected {
    Eager { src: Epid, data: Bytes },
    Rts { src: Epid, send_id: u32, len: usize },
}

impl Unexpected {
    pub fn src(&self) -> Epid {
        match self {
            Unexpected::Eager { src, .. } | Unexpected::Rts { src, .. } => *src,
        }
    }
}

#[derive(Default)]
pub struct MatchQueue {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
}

impl MatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }

    pub fn unexpected_len(&self) -> usize {
        self.unexpected.len()
    }

    /// Posts a receive, or returns the earliest unexpected message it
    /// matches together with the receive.
    pub fn post(&mut self, recv: PostedRecv) -> Option<(PostedRecv, Unexpected)> {
        match self.unexpected.iter().position(|u| recv.matches(u.src())) {
            Some(pos) => self.unexpected.remove(pos).map(|u| (recv, u)),
            None => {
                self.posted.push_back(recv);
                None
            }
        }
    }

    /// Matches an arrived message, or keeps it as unexpected.
    pub fn arrive(&mut self, msg: Unexpected) -> Option<(PostedRecv, Unexpected)> {
        let src = msg.src();
        match self.posted.iter().position(|r| r.matches(src)) {
            Some(pos) => self.posted.remove(pos).map(|r| (r, msg)),
            None => {
                self.unexpected.push_back(msg);
                None
            }
        }
    }

    /// Removes every unexpected message from `src`.
    pub fn drop_source(&mut self, src: Epid) -> usize {
        let before = self.unexpected.len();
        self.unexpected.retain(|u| u.src() != src);
        before - self.unexpected.len()
    }

    /// Takes the receives posted specifically for `src`.
    pub fn take_posted_from(&mut self, src: Epid) -> Vec<PostedRecv> {
        let (taken, kept): (VecDeque<PostedRecv>, VecDeque<PostedRecv>) =
            self.posted.drain(..).partition(|r| r.src == Some(src));
        self.posted = kept;
        taken.into()
    }

    /// Takes every posted receive, for endpoint teardown.
    pub fn drain_posted(&mut self) -> Vec<PostedRecv> {
        self.posted.drain(..).collect()
    }
}
