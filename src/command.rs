//! Cross-thread command protocol: a bounded, lock-free ring carrying
//! typed intents from the control context to the mixing context.
//!
//! Implemented over `crossbeam::queue::ArrayQueue` rather than a
//! `Mutex`-guarded array, per the spec's Design Notes allowance to
//! replace the mutex-guarded ring with a lock-free SPSC ring "where the
//! execution model permits" — a single allocation happens at
//! construction and none afterwards.

use crossbeam::queue::ArrayQueue;

use crate::channel::{LoopBehavior, PlayOptions, Routing, StopMode};

/// Default command-ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 16;

/// Target of an operation that may address one channel or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Channel(usize),
    All,
}

/// A single queued intent, handed from the control context to the
/// mixing context.
#[derive(Debug, Clone)]
pub enum Command {
    Play {
        channel: usize,
        filename: String,
        options: PlayOptions,
    },
    Stop {
        channel: usize,
        mode: StopMode,
    },
    StopAll {
        mode: StopMode,
    },
    SetVolume {
        channel: usize,
        gain: f32,
    },
    SetMasterVolume {
        gain: f32,
    },
    SetRouting {
        channel: usize,
        routing: Routing,
    },
    StopLooping {
        target: Target,
    },
    Queue {
        channel: usize,
        filename: String,
        options: PlayOptions,
        behavior: LoopBehavior,
    },
    ClearQueue {
        target: Target,
    },
}

/// Bounded SPSC/MPMC ring of [`Command`]s.
///
/// Producers (the control context) call [`CommandQueue::push`], which
/// never blocks: a full ring simply rejects the command, and it is the
/// caller's responsibility to retry or fall back to the synchronous API.
/// The consumer (the mixing context) calls [`CommandQueue::drain`] once
/// at the head of every tick.
pub struct CommandQueue {
    ring: ArrayQueue<Command>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        CommandQueue {
            ring: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Enqueue a command. Returns `false` (and drops nothing but the
    /// command itself, handed back to the caller) if the ring is full.
    pub fn push(&self, command: Command) -> Result<(), Command> {
        self.ring.push(command)
    }

    /// Drain every pending command in FIFO order.
    pub fn drain(&self) -> Vec<Command> {
        let mut out = Vec::with_capacity(self.ring.len());
        while let Some(cmd) = self.ring.pop() {
            out.push(cmd);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_preserve_fifo_order() {
        let q = CommandQueue::new(4);
        for i in 0..3 {
            q.push(Command::SetVolume {
                channel: i,
                gain: 0.5,
            })
            .unwrap();
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        for (i, cmd) in drained.iter().enumerate() {
            match cmd {
                Command::SetVolume { channel, .. } => assert_eq!(*channel, i),
                _ => panic!("unexpected command"),
            }
        }
    }

    #[test]
    fn push_rejects_when_full() {
        let q = CommandQueue::new(1);
        q.push(Command::SetMasterVolume { gain: 1.0 }).unwrap();
        let rejected = q.push(Command::SetMasterVolume { gain: 0.0 });
        assert!(rejected.is_err());
    }

    #[test]
    fn drain_on_empty_queue_is_empty() {
        let q = CommandQueue::new(4);
        assert!(q.drain().is_empty());
    }
}
