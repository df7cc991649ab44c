//! Pending request collection
//!
//! Packets are kept in scheduling order and indexed by opaque. Retried
//! packets keep their original start time, so the oldest packet is not
//! necessarily the first one.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use super::packet::Packet;

#[derive(Debug, Default)]
pub struct PendingQueue {
    next_seq: u64,
    by_seq: BTreeMap<u64, Packet>,
    by_opaque: HashMap<u32, u64>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet. A packet already pending under the same opaque is
    /// evicted and returned.
    pub fn push(&mut self, packet: Packet) -> Option<Packet> {
        let evicted = self.remove(packet.opaque);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_opaque.insert(packet.opaque, seq);
        self.by_seq.insert(seq, packet);
        evicted
    }

    pub fn find(&self, opaque: u32) -> Option<&Packet> {
        let seq = self.by_opaque.get(&opaque)?;
        self.by_seq.get(seq)
    }

    pub fn find_mut(&mut self, opaque: u32) -> Option<&mut Packet> {
        let seq = self.by_opaque.get(&opaque)?;
        self.by_seq.get_mut(seq)
    }

    pub fn remove(&mut self, opaque: u32) -> Option<Packet> {
        let seq = self.by_opaque.remove(&opaque)?;
        self.by_seq.remove(&seq)
    }

    /// Remove a packet, keeping its position so it can be put back with
    /// [`PendingQueue::restore`]
    pub fn take(&mut self, opaque: u32) -> Option<(u64, Packet)> {
        let seq = self.by_opaque.remove(&opaque)?;
        self.by_seq.remove(&seq).map(|p| (seq, p))
    }

    /// Put back a packet removed with [`PendingQueue::take`]
    pub fn restore(&mut self, seq: u64, packet: Packet) {
        self.by_opaque.insert(packet.opaque, seq);
        self.by_seq.insert(seq, packet);
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.by_seq.values()
    }

    /// Earliest start time among pending packets
    pub fn oldest_start(&self) -> Option<Instant> {
        self.by_seq.values().map(|p| p.start).min()
    }

    /// Remove every packet started at or before `threshold`
    pub fn expire(&mut self, threshold: Instant) -> Vec<Packet> {
        let expired: Vec<u64> = self
            .by_seq
            .iter()
            .filter(|(_, p)| p.start <= threshold)
            .map(|(seq, _)| *seq)
            .collect();
        self.take_seqs(expired)
    }

    /// Remove everything, in scheduling order
    pub fn drain(&mut self) -> Vec<Packet> {
        self.by_opaque.clear();
        std::mem::take(&mut self.by_seq).into_values().collect()
    }

    /// Packets not yet handed to the transport, marked flushed. Returns
    /// their encoded bytes in order.
    pub fn flush_unflushed(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for packet in self.by_seq.values_mut().filter(|p| !p.flags.flushed) {
            out.extend_from_slice(&packet.data);
            packet.flags.flushed = true;
        }
        out
    }

    /// Forget which packets were written, so all of them go out again on
    /// the next connection
    pub fn reset_flushed(&mut self) {
        for packet in self.by_seq.values_mut() {
            packet.flags.flushed = false;
        }
    }

    fn take_seqs(&mut self, seqs: Vec<u64>) -> Vec<Packet> {
        let mut out = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(packet) = self.by_seq.remove(&seq) {
                self.by_opaque.remove(&packet.opaque);
                out.push(packet);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, RequestHeader};
    use std::time::Duration;

    fn packet(opaque: u32, start: Instant) -> Packet {
        let mut hdr = RequestHeader::new(Opcode::GET);
        hdr.opaque = opaque;
        Packet::new(hdr, &[], b"k", &[], 0, start)
    }

    #[test]
    fn test_find_and_remove_by_opaque() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.push(packet(1, now));
        queue.push(packet(2, now));

        assert_eq!(queue.find(2).unwrap().opaque, 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.remove(1).unwrap().opaque, 1);
        assert!(queue.find(1).is_none());
        assert!(queue.remove(1).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_take_and_restore_keeps_position() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.push(packet(1, now));
        queue.push(packet(2, now));

        let (seq, pkt) = queue.take(1).unwrap();
        assert!(queue.find(1).is_none());
        queue.restore(seq, pkt);

        let order: Vec<u32> = queue.iter().map(|p| p.opaque).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(queue.find(1).is_some());
    }

    #[test]
    fn test_duplicate_opaque_evicts() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        assert!(queue.push(packet(1, now)).is_none());
        let evicted = queue.push(packet(1, now + Duration::from_secs(1)));
        assert_eq!(evicted.unwrap().start, now);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_expire_uses_start_not_order() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.push(packet(1, now + Duration::from_secs(5)));
        // A retried packet scheduled later but started earlier
        queue.push(packet(2, now));
        queue.push(packet(3, now + Duration::from_secs(10)));

        assert_eq!(queue.oldest_start(), Some(now));
        let expired = queue.expire(now + Duration::from_secs(5));
        let opaques: Vec<u32> = expired.iter().map(|p| p.opaque).collect();
        assert_eq!(opaques, vec![1, 2]);
        assert_eq!(queue.len(), 1);
        assert!(queue.find(3).is_some());
    }

    #[test]
    fn test_flush_unflushed_once() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.push(packet(1, now));
        queue.push(packet(2, now));

        let bytes = queue.flush_unflushed();
        assert_eq!(bytes.len(), 2 * (24 + 1));
        assert!(queue.flush_unflushed().is_empty());
        assert!(queue.iter().all(|p| p.flags.flushed));

        queue.reset_flushed();
        assert_eq!(queue.flush_unflushed(), bytes);
    }

    #[test]
    fn test_drain_in_order() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        for opaque in [3, 1, 2] {
            queue.push(packet(opaque, now));
        }
        let drained: Vec<u32> = queue.drain().iter().map(|p| p.opaque).collect();
        assert_eq!(drained, vec![3, 1, 2]);
        assert!(queue.is_empty());
        assert!(queue.find(3).is_none());
    }
}
