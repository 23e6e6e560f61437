use super::slot::SlotError;
use bytes::Bytes;
use flume::{Receiver, Sender, TryRecvError, TrySendError};
use std::collections::VecDeque;

/// Bounded point-to-point links between every pair of ranks
///
/// Each link is a flume channel holding at most `capacity` slots. Nothing blocks: sends that don't fit
/// wait in a per-destination queue of the sending [`Endpoint`] until [`Endpoint::flush`] moves them.
pub struct Network {
    endpoints: Vec<Endpoint>,
}

impl Network {
    pub fn new(num_ranks: usize, capacity: usize) -> Self {
        let mut endpoints: Vec<Endpoint> = (0..num_ranks)
            .map(|rank| Endpoint {
                rank,
                outgoing: (0..num_ranks).map(|_| None).collect(),
                incoming: (0..num_ranks).map(|_| None).collect(),
                pending: (0..num_ranks).map(|_| VecDeque::new()).collect(),
            })
            .collect();

        for from in 0..num_ranks {
            for to in (0..num_ranks).filter(|to| *to != from) {
                let (tx, rx) = flume::bounded(capacity);
                endpoints[from].outgoing[to] = Some(tx);
                endpoints[to].incoming[from] = Some(rx);
            }
        }

        Self { endpoints }
    }

    pub fn num_ranks(&self) -> usize {
        self.endpoints.len()
    }

    /// One endpoint per rank, ordered by rank
    pub fn into_endpoints(self) -> Vec<Endpoint> {
        self.endpoints
    }
}

/// One rank's side of the [`Network`]
pub struct Endpoint {
    rank: usize,
    outgoing: Vec<Option<Sender<Bytes>>>,
    incoming: Vec<Option<Receiver<Bytes>>>,
    pending: Vec<VecDeque<Bytes>>,
}

impl Endpoint {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.outgoing.len()
    }

    /// Every rank except this one
    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_ranks()).filter(move |peer| *peer != self.rank)
    }

    /// Queue a slot for `to`; it is sent by the next [`Endpoint::flush`]
    pub fn post(&mut self, to: usize, slot: Bytes) {
        self.pending[to].push_back(slot);
    }

    pub fn post_all(&mut self, to: usize, slots: impl IntoIterator<Item = Bytes>) {
        self.pending[to].extend(slots);
    }

    /// Move as many queued slots as the links accept, returning true once every queue is empty
    pub fn flush(&mut self) -> Result<bool, SlotError> {
        let mut drained = true;
        for (to, queue) in self.pending.iter_mut().enumerate() {
            let Some(tx) = &self.outgoing[to] else {
                continue;
            };
            while let Some(slot) = queue.pop_front() {
                match tx.try_send(slot) {
                    Ok(()) => (),
                    Err(TrySendError::Full(slot)) => {
                        queue.push_front(slot);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => return Err(SlotError::Disconnected(to)),
                }
            }
            drained &= queue.is_empty();
        }
        Ok(drained)
    }

    /// Take the next slot from `from`, if one has arrived
    pub fn try_recv(&mut self, from: usize) -> Result<Option<Bytes>, SlotError> {
        let Some(rx) = &self.incoming[from] else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(slot) => Ok(Some(slot)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SlotError::Disconnected(from)),
        }
    }

    /// Have all queued slots been handed to the links
    pub fn is_drained(&self) -> bool {
        self.pending.iter().all(|queue| queue.is_empty())
    }

    /// Drop every link and queued slot; peers see this rank as disconnected
    pub fn disconnect(&mut self) {
        self.outgoing.iter_mut().for_each(|tx| *tx = None);
        self.incoming.iter_mut().for_each(|rx| *rx = None);
        self.pending.iter_mut().for_each(VecDeque::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_bounded() {
        let mut endpoints = Network::new(3, 2).into_endpoints();
        assert_eq!(endpoints[1].peers().collect::<Vec<_>>(), vec![0, 2]);

        for i in 0..5_u8 {
            endpoints[0].post(2, Bytes::from(vec![i]));
        }
        endpoints[0].post(1, Bytes::from_static(b"x"));
        assert!(!endpoints[0].flush().unwrap());

        // the link to rank 2 holds two slots
        let mut received = Vec::new();
        while let Some(slot) = endpoints[2].try_recv(0).unwrap() {
            received.push(slot[0]);
        }
        assert_eq!(received, vec![0, 1]);
        assert_eq!(endpoints[2].try_recv(1).unwrap(), None);

        while !endpoints[0].flush().unwrap() {
            while let Some(slot) = endpoints[2].try_recv(0).unwrap() {
                received.push(slot[0]);
            }
        }
        while let Some(slot) = endpoints[2].try_recv(0).unwrap() {
            received.push(slot[0]);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert_eq!(endpoints[1].try_recv(0).unwrap().unwrap(), Bytes::from_static(b"x"));
        assert!(endpoints[0].is_drained());
    }

    #[test]
    fn disconnected_peers() {
        let mut endpoints = Network::new(2, 1).into_endpoints();
        let second = endpoints.pop().unwrap();
        drop(second);
        endpoints[0].post(1, Bytes::from_static(b"x"));
        assert_eq!(endpoints[0].flush(), Err(SlotError::Disconnected(1)));
        assert_eq!(endpoints[0].try_recv(1), Err(SlotError::Disconnected(1)));
    }
}
