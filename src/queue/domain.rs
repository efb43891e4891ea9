//! Cola de salida acotada.
//!
//! FIFO de mensajes ya serializados con tópico, QoS y prioridad. La prioridad
//! sólo se consulta cuando la cola está llena al encolar: `1` se descarta al
//! final, números más altos se descartan primero.
//!
//! # Política de desalojo
//! Son candidatos los mensajes con prioridad numérica mayor o igual a la del
//! entrante. Se desaloja primero el número más alto y, a igual prioridad, el
//! más viejo. Si los candidatos no alcanzan para liberar el espacio, no se
//! desaloja nada y el entrante se rechaza.


use std::collections::VecDeque;
use thiserror::Error;
use tracing::warn;
use crate::message::domain::Topic;


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("payload de {size} bytes supera el máximo de {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("memoria de cola agotada: se necesitan {needed} bytes, libres {available}")]
    OutOfMemory { needed: usize, available: usize },
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: Topic,
    pub qos: u8,
    pub priority: u8,
    pub payload: Vec<u8>,
    pub created_ms: u64,
    seq: u64,
}


impl OutboundMessage {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub capacity_bytes: usize,
    pub max_message_bytes: usize,
    pub max_messages: usize,
}


#[derive(Debug)]
pub struct OutboundQueue {
    limits: QueueLimits,
    messages: VecDeque<OutboundMessage>,
    used_bytes: usize,
    next_seq: u64,
}


impl OutboundQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self { limits, messages: VecDeque::new(), used_bytes: 0, next_seq: 0 }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &OutboundMessage> {
        self.messages.iter()
    }

    /// Encola un payload, desalojando mensajes descartables si hace falta.
    pub fn enqueue(&mut self, payload: Vec<u8>, topic: Topic, qos: u8, priority: u8, now_ms: u64) -> Result<(), QueueError> {
        let size = payload.len();
        if size > self.limits.max_message_bytes {
            return Err(QueueError::PayloadTooLarge { size, max: self.limits.max_message_bytes });
        }

        if !self.fits(size, 0, 0) {
            let victims = self.plan_eviction(priority, size).ok_or(QueueError::OutOfMemory {
                needed: size,
                available: self.limits.capacity_bytes.saturating_sub(self.used_bytes),
            })?;
            self.evict(victims);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.used_bytes += size;
        self.messages.push_back(OutboundMessage { topic, qos, priority, payload, created_ms: now_ms, seq });
        Ok(())
    }

    pub fn front(&self) -> Option<&OutboundMessage> {
        self.messages.front()
    }

    /// Saca el primer mensaje y libera sus bytes.
    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        let msg = self.messages.pop_front()?;
        self.used_bytes -= msg.size();
        Some(msg)
    }

    /// Pasa el primer mensaje al final sin tocar la contabilidad.
    pub fn rotate_front_to_back(&mut self) {
        if let Some(msg) = self.messages.pop_front() {
            self.messages.push_back(msg);
        }
    }

    fn fits(&self, incoming: usize, freed_bytes: usize, freed_slots: usize) -> bool {
        self.used_bytes - freed_bytes + incoming <= self.limits.capacity_bytes
            && self.messages.len() - freed_slots < self.limits.max_messages
    }

    fn plan_eviction(&self, incoming_priority: u8, incoming: usize) -> Option<Vec<usize>> {
        let mut candidates: Vec<usize> = (0..self.messages.len())
            .filter(|i| self.messages[*i].priority >= incoming_priority)
            .collect();
        candidates.sort_by(|a, b| {
            let (ma, mb) = (&self.messages[*a], &self.messages[*b]);
            mb.priority.cmp(&ma.priority).then(ma.seq.cmp(&mb.seq))
        });

        let mut chosen = Vec::new();
        let (mut freed_bytes, mut freed_slots) = (0, 0);
        for idx in candidates {
            if self.fits(incoming, freed_bytes, freed_slots) {
                break;
            }
            freed_bytes += self.messages[idx].size();
            freed_slots += 1;
            chosen.push(idx);
        }
        self.fits(incoming, freed_bytes, freed_slots).then_some(chosen)
    }

    fn evict(&mut self, mut victims: Vec<usize>) {
        victims.sort_unstable_by(|a, b| b.cmp(a));
        for idx in victims {
            if let Some(msg) = self.messages.remove(idx) {
                self.used_bytes -= msg.size();
                warn!("Warning: mensaje desalojado de la cola, tópico {:?} prioridad {} ({} bytes)",
                      msg.topic, msg.priority, msg.size());
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity_bytes: usize) -> OutboundQueue {
        OutboundQueue::new(QueueLimits { capacity_bytes, max_message_bytes: 64, max_messages: 30 })
    }

    fn priorities(q: &OutboundQueue) -> Vec<u8> {
        q.iter().map(|m| m.priority).collect()
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut q = queue(1024);
        let err = q.enqueue(vec![0; 65], Topic::Telemetry, 1, 20, 0).unwrap_err();
        assert_eq!(err, QueueError::PayloadTooLarge { size: 65, max: 64 });
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_evicts_the_most_droppable_message() {
        let mut q = queue(30);
        q.enqueue(vec![1; 10], Topic::Alert, 1, 1, 0).unwrap();
        q.enqueue(vec![2; 10], Topic::Telemetry, 1, 5, 1).unwrap();
        q.enqueue(vec![3; 10], Topic::Alert, 1, 1, 2).unwrap();

        q.enqueue(vec![4; 10], Topic::Alert, 1, 3, 3).unwrap();

        assert_eq!(priorities(&q), vec![1, 1, 3]);
        assert_eq!(q.used_bytes(), 30);
    }

    #[test]
    fn equal_priority_evicts_oldest_first() {
        let mut q = queue(20);
        q.enqueue(vec![1; 10], Topic::Telemetry, 1, 20, 0).unwrap();
        q.enqueue(vec![2; 10], Topic::Telemetry, 1, 20, 1).unwrap();
        q.enqueue(vec![3; 10], Topic::Telemetry, 1, 20, 2).unwrap();
        let payloads: Vec<u8> = q.iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, vec![2, 3]);
    }

    #[test]
    fn incoming_with_nothing_droppable_is_rejected_without_eviction() {
        let mut q = queue(20);
        q.enqueue(vec![1; 10], Topic::Onboarding, 1, 1, 0).unwrap();
        q.enqueue(vec![2; 10], Topic::Telemetry, 1, 20, 1).unwrap();

        let err = q.enqueue(vec![3; 20], Topic::Alert, 1, 10, 2).unwrap_err();
        assert_eq!(err, QueueError::OutOfMemory { needed: 20, available: 0 });
        assert_eq!(priorities(&q), vec![1, 20]);
        assert_eq!(q.used_bytes(), 20);
    }

    #[test]
    fn message_count_limit_also_triggers_eviction() {
        let mut q = OutboundQueue::new(QueueLimits { capacity_bytes: 1024, max_message_bytes: 64, max_messages: 2 });
        q.enqueue(vec![1], Topic::Telemetry, 1, 20, 0).unwrap();
        q.enqueue(vec![2], Topic::Alert, 1, 10, 1).unwrap();
        q.enqueue(vec![3], Topic::Alert, 1, 10, 2).unwrap();
        assert_eq!(priorities(&q), vec![10, 10]);
        q.enqueue(vec![4], Topic::Onboarding, 1, 1, 3).unwrap();
        let payloads: Vec<u8> = q.iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, vec![3, 4]);
    }

    #[test]
    fn byte_usage_never_exceeds_capacity() {
        let mut q = queue(100);
        for i in 0..200u64 {
            let size = (i as usize * 7) % 40 + 1;
            let priority = (i % 4) as u8 * 10 + 1;
            let _ = q.enqueue(vec![0; size], Topic::Telemetry, 1, priority, i);
            assert!(q.used_bytes() <= 100);
            assert_eq!(q.used_bytes(), q.iter().map(|m| m.size()).sum::<usize>());
        }
    }

    #[test]
    fn rotate_and_pop_keep_accounting() {
        let mut q = queue(100);
        q.enqueue(vec![1; 4], Topic::Telemetry, 1, 20, 0).unwrap();
        q.enqueue(vec![2; 6], Topic::Onboarding, 1, 1, 1).unwrap();
        q.rotate_front_to_back();
        assert_eq!(q.front().unwrap().topic, Topic::Onboarding);
        assert_eq!(q.used_bytes(), 10);
        let msg = q.pop_front().unwrap();
        assert_eq!(msg.size(), 6);
        assert_eq!(q.used_bytes(), 4);
    }
}
