use crate::{Msg, NodeID};
use std::collections::{BTreeMap, VecDeque};
use submerge_base::{err, Result};

/// Each message sent or received turns into a single `[u8]` buffer
/// added to the incoming or outgoing deque. Transports turn these into
/// bytes-on-the-wire with whatever framing they find necessary.
#[derive(Debug, Default)]
pub struct IOQueues {
    outgoing: VecDeque<(NodeID, Box<[u8]>)>,
    incoming: VecDeque<(NodeID, Box<[u8]>)>,
}

#[derive(Debug)]
struct Request {
    req: Box<Msg>,
    res: Option<Box<Msg>>,
}

/// Tracks one peer-to-peer bus connection's in-flight
/// request/response pairing, the way the replication transport pairs
/// acks to the prepares that solicited them. Encoding is MessagePack
/// via `rmp-serde`, matching the wire format `submerge-net` already
/// uses elsewhere.
#[derive(Debug, Default)]
pub struct BusLink {
    incoming: VecDeque<Box<Msg>>,
    requests: BTreeMap<i64, Request>,
    complete: VecDeque<i64>,
    ioqueues: IOQueues,
}

#[derive(Debug, Default)]
pub enum RecvMsg {
    #[default]
    NoMsgs,
    Single(Box<Msg>),
    Paired {
        req: Box<Msg>,
        res: Box<Msg>,
    },
}

impl BusLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_msg(&mut self, msg: Msg) -> Result<()> {
        let dst = msg.dst;
        let buf = rmp_serde::to_vec(&msg)?;
        self.ioqueues
            .outgoing
            .push_back((dst, buf.into_boxed_slice()));
        if !msg.response {
            self.requests.insert(
                msg.sequence,
                Request {
                    req: Box::new(msg),
                    res: None,
                },
            );
        }
        Ok(())
    }

    fn maybe_pop_incoming_msg(&mut self) -> Option<Box<Msg>> {
        if (self.incoming.len() + self.complete.len()) & 1 == 0 {
            self.incoming.pop_front()
        } else {
            None
        }
    }

    pub fn recv_msg(&mut self) -> Result<RecvMsg> {
        if self.incoming.is_empty() && self.complete.is_empty() {
            if let Some((src, buf)) = self.ioqueues.incoming.pop_front() {
                self.decode_msg(src, buf)?;
            }
        }

        if let Some(msg) = self.maybe_pop_incoming_msg() {
            Ok(RecvMsg::Single(msg))
        } else if let Some(id) = self.complete.pop_front() {
            if let Some(req) = self.requests.remove(&id) {
                if let Some(res) = req.res {
                    Ok(RecvMsg::Paired { req: req.req, res })
                } else {
                    Err(err("missing response in complete request"))
                }
            } else {
                Err(err("missing request"))
            }
        } else {
            Ok(RecvMsg::NoMsgs)
        }
    }

    pub fn recv_bytes(&mut self, src: NodeID, buf: Box<[u8]>) -> Result<()> {
        self.ioqueues.incoming.push_back((src, buf));
        Ok(())
    }

    pub fn send_bytes(&mut self) -> Result<Option<(NodeID, Box<[u8]>)>> {
        Ok(self.ioqueues.outgoing.pop_front())
    }

    fn decode_msg(&mut self, src: NodeID, buf: Box<[u8]>) -> Result<()> {
        let msg: Box<Msg> = Box::new(rmp_serde::from_slice(buf.as_ref())?);
        if msg.src != src {
            return Err(err("mismatched source"));
        }
        if msg.response {
            if let Some(req) = self.requests.get_mut(&msg.sequence) {
                if req.res.is_none() {
                    req.res = Some(msg);
                    self.complete.push_back(req.req.sequence);
                } else {
                    return Err(err("duplicate response"));
                }
            } else {
                // Response to a request we no longer track (e.g. we
                // already gave up on it); drop silently.
            }
        } else {
            self.incoming.push_back(msg);
        }
        Ok(())
    }
}
