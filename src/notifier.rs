use std::{
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, RwLock,
    },
    thread,
};

/// Lightweight event fan-out used for transport status updates. Observers
/// either drain a channel or hand in a callback that runs on its own thread.
/// Dropped receivers are lazily cleaned up on the next notify.
#[derive(Clone)]
pub struct Notifier<Event: Send + Sync + Clone + 'static> {
    senders: Arc<RwLock<Vec<Sender<Event>>>>,
}

impl<Event: Send + Sync + Clone + 'static> Notifier<Event> {
    pub fn new() -> Self {
        Self {
            senders: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn notify(&self, event: Event) {
        if let Ok(mut senders) = self.senders.write() {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn observer(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        if let Ok(mut senders) = self.senders.write() {
            senders.push(tx);
        }
        rx
    }

    pub fn observe(&self, mut callback: impl FnMut(Event) + Send + 'static) {
        let rx = self.observer();
        thread::spawn(move || {
            rx.iter().for_each(|e| callback(e));
        });
    }

    pub fn observer_count(&self) -> usize {
        self.senders.read().map(|senders| senders.len()).unwrap_or(0)
    }
}

impl<Event: Send + Sync + Clone + 'static> Default for Notifier<Event> {
    fn default() -> Self {
        Self::new()
    }
}
