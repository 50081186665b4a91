use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use ffmpeg_next as ffmpeg;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// One entry of a [`PacketQueue`].
///
/// A seek flushes the queues and enqueues `Flush` behind the flushed
/// packets; the consumer resets its decoder when it sees the marker. The
/// marker occupies a queue slot but contributes no bytes.
pub enum QueuedPacket {
    Data(ffmpeg::Packet),
    Flush,
}

impl QueuedPacket {
    pub fn size(&self) -> usize {
        match self {
            QueuedPacket::Data(packet) => packet.size(),
            QueuedPacket::Flush => 0,
        }
    }
}

/// Outcome of [`PacketQueue::get`].
pub enum PacketGet {
    Packet(QueuedPacket),
    /// Queue was empty and the caller asked not to block.
    Empty,
    /// The queue was aborted for shutdown; the consumer should exit.
    Aborted,
}

struct Fifo {
    entries: VecDeque<QueuedPacket>,
    nb_packets: usize,
    size_bytes: usize,
}

/// Thread-safe FIFO of compressed packets between the demuxer and one
/// decoder. Packets are moved in and out, never shared.
pub struct PacketQueue {
    name: &'static str,
    fifo: Mutex<Fifo>,
    cond: Condvar,
    // lock-free mirror of size_bytes, read by the demuxer for backpressure
    size_hint: AtomicUsize,
    aborted: AtomicBool,
}

impl PacketQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fifo: Mutex::new(Fifo {
                entries: VecDeque::new(),
                nb_packets: 0,
                size_bytes: 0,
            }),
            cond: Condvar::new(),
            size_hint: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        }
    }

    /// Takes ownership of the packet and wakes one blocked consumer.
    pub fn put(&self, entry: QueuedPacket) {
        let size = entry.size();
        let mut fifo = self.fifo.lock();
        fifo.entries.push_back(entry);
        fifo.nb_packets += 1;
        fifo.size_bytes += size;
        self.size_hint.store(fifo.size_bytes, Ordering::Relaxed);
        trace!(
            queue = self.name,
            packets = fifo.nb_packets,
            bytes = fifo.size_bytes,
            "packet queued"
        );
        self.cond.notify_one();
    }

    /// Pops the head of the queue. With `block` set, waits until a packet
    /// arrives or the queue is aborted; otherwise returns
    /// [`PacketGet::Empty`] immediately.
    pub fn get(&self, block: bool) -> PacketGet {
        let mut fifo = self.fifo.lock();
        loop {
            if self.aborted.load(Ordering::Acquire) {
                return PacketGet::Aborted;
            }
            if let Some(entry) = fifo.entries.pop_front() {
                fifo.nb_packets -= 1;
                fifo.size_bytes -= entry.size();
                self.size_hint.store(fifo.size_bytes, Ordering::Relaxed);
                return PacketGet::Packet(entry);
            }
            if !block {
                return PacketGet::Empty;
            }
            self.cond.wait(&mut fifo);
        }
    }

    /// Drops every held packet and resets the counters. Does not wake
    /// blocked consumers; a seek follows up with a `Flush` marker which
    /// does.
    pub fn flush(&self) {
        let mut fifo = self.fifo.lock();
        fifo.entries.clear();
        fifo.nb_packets = 0;
        fifo.size_bytes = 0;
        self.size_hint.store(0, Ordering::Relaxed);
        trace!(queue = self.name, "queue flushed");
    }

    /// Marks the queue dead and wakes every blocked consumer so workers can
    /// observe the quit flag.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Racy byte-size hint; only suitable for soft-cap backpressure checks.
    pub fn size_bytes(&self) -> usize {
        self.size_hint.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn locked_totals(&self) -> (usize, usize, usize) {
        let fifo = self.fifo.lock();
        let sum: usize = fifo.entries.iter().map(QueuedPacket::size).sum();
        (fifo.nb_packets, fifo.size_bytes, sum)
    }
}
