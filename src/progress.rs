// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: progress  -  single-writer, multi-observer progress hub
//
//  Download progress and flash progress are separate phases. Each phase gets
//  its own Reporter which starts at 0 and only ever moves forward; the two
//  are never summed or interleaved.
// ─────────────────────────────────────────────────────────────────────────────

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::cancel::{Slot, SlotGuard};
use crate::error::{FlashError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Download,
    Flash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub phase:   Phase,
    pub percent: u8,
    pub message: String,
}

type Observer = Box<dyn FnMut(&ProgressUpdate) -> bool + Send>;

#[derive(Default)]
pub struct ProgressHub {
    observers: Mutex<Vec<Observer>>,
    last:      Mutex<Option<ProgressUpdate>>,
    writer:    Slot,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback observer.
    pub fn subscribe<F>(&self, mut f: F)
    where
        F: FnMut(&ProgressUpdate) + Send + 'static,
    {
        self.push(Box::new(move |u| {
            f(u);
            true
        }));
    }

    /// Register a channel observer; it is dropped once the receiver goes away.
    pub fn channel(&self) -> Receiver<ProgressUpdate> {
        let (tx, rx): (Sender<ProgressUpdate>, _) = mpsc::channel();
        self.push(Box::new(move |u| tx.send(u.clone()).is_ok()));
        rx
    }

    /// Most recent update delivered to observers.
    pub fn last(&self) -> Option<ProgressUpdate> {
        self.last.lock().ok().and_then(|l| l.clone())
    }

    /// Start a phase. Only one reporter may exist at a time.
    pub fn reporter(&self, phase: Phase) -> Result<Reporter<'_>> {
        let guard = self.writer.try_claim().ok_or(FlashError::Busy("progress writer"))?;
        Ok(Reporter { hub: self, _guard: guard, phase, percent: 0 })
    }

    fn push(&self, observer: Observer) {
        if let Ok(mut obs) = self.observers.lock() {
            obs.push(observer);
        }
    }

    fn publish(&self, update: ProgressUpdate) {
        if let Ok(mut obs) = self.observers.lock() {
            obs.retain_mut(|o| o(&update));
        }
        if let Ok(mut last) = self.last.lock() {
            *last = Some(update);
        }
    }
}

/// The single writer of one phase.
pub struct Reporter<'a> {
    hub:    &'a ProgressHub,
    _guard: SlotGuard<'a>,
    phase:  Phase,
    percent: u8,
}

impl Reporter<'_> {
    /// Publish a new percentage. Values below the current one are raised to
    /// it and values above 100 are capped.
    pub fn report(&mut self, percent: u8, message: impl Into<String>) {
        self.percent = self.percent.max(percent.min(100));
        self.hub.publish(ProgressUpdate {
            phase:   self.phase,
            percent: self.percent,
            message: message.into(),
        });
    }

    /// Publish a status line without moving the percentage.
    pub fn status(&mut self, message: impl Into<String>) {
        let p = self.percent;
        self.report(p, message);
    }

    /// Byte-count form used by downloads.
    pub fn report_bytes(&mut self, done: u64, total: Option<u64>, message: impl Into<String>) {
        let pct = match total {
            Some(t) if t > 0 => ((done.min(t) * 100) / t) as u8,
            _ => self.percent,
        };
        self.report(pct, message);
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn percentages_never_move_backwards_or_past_100() {
        let hub = ProgressHub::new();
        let rx = hub.channel();
        let mut r = hub.reporter(Phase::Flash).unwrap();
        r.report(30, "a");
        r.report(20, "b");
        r.report(250, "c");
        drop(r);

        let seen: Vec<u8> = rx.try_iter().map(|u| u.percent).collect();
        assert_eq!(seen, vec![30, 30, 100]);
    }

    #[test]
    fn second_writer_is_rejected_while_first_is_alive() {
        let hub = ProgressHub::new();
        let first = hub.reporter(Phase::Download).unwrap();
        assert!(matches!(hub.reporter(Phase::Flash), Err(FlashError::Busy(_))));
        drop(first);
        let second = hub.reporter(Phase::Flash).unwrap();
        assert_eq!(second.percent(), 0);
    }

    #[test]
    fn every_observer_sees_every_update() {
        let hub = ProgressHub::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        hub.subscribe(move |_| *c.lock().unwrap() += 1);
        let rx = hub.channel();

        let mut r = hub.reporter(Phase::Download).unwrap();
        r.report_bytes(512, Some(1024), "half");
        r.status("still half");
        drop(r);

        assert_eq!(*count.lock().unwrap(), 2);
        let updates: Vec<_> = rx.try_iter().collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].percent, 50);
        assert_eq!(hub.last().unwrap().message, "still half");
    }

    #[test]
    fn dropped_channel_observer_is_pruned() {
        let hub = ProgressHub::new();
        drop(hub.channel());
        let mut r = hub.reporter(Phase::Flash).unwrap();
        r.report(10, "x");
        r.report(20, "y");
        assert_eq!(hub.observers.lock().unwrap().len(), 0);
    }
}
