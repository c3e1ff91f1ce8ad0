//! Bounded registry of application callback objects with per-remote
//! identity.
//!
//! Each registered callback gets a cookie id. Remote-backed callbacks
//! (IPC clients) announce their death through `RPCProxy::register_disconnect`,
//! which is wired here to post a disconnect message back onto the dispatch
//! loop so the entry is reaped on the loop thread.

use std::collections::HashMap;

use tokio::sync::mpsc::Sender;

use crate::{Message, RPCProxy};

pub struct Callbacks<T: Send + ?Sized> {
    callbacks: HashMap<u32, Box<T>>,
    capacity: usize,
    next_id: u32,
    tx: Sender<Message>,
    disconnected_message: fn(u32) -> Message,
}

impl<T: RPCProxy + Send + ?Sized> Callbacks<T> {
    pub fn new(capacity: usize, tx: Sender<Message>, disconnected_message: fn(u32) -> Message) -> Self {
        Self {
            callbacks: HashMap::new(),
            capacity,
            next_id: 1,
            tx,
            disconnected_message,
        }
    }

    /// Stores a callback and returns its cookie, or None when the registry
    /// is at capacity.
    pub fn add_callback(&mut self, mut callback: Box<T>) -> Option<u32> {
        if self.callbacks.len() >= self.capacity {
            log::warn!("Callback registry full ({} entries)", self.capacity);
            return None;
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let tx = self.tx.clone();
        let disconnected_message = self.disconnected_message;
        callback.register_disconnect(Box::new(move |cb_id| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(disconnected_message(cb_id)).await;
            });
        }));

        self.callbacks.insert(id, callback);
        Some(id)
    }

    pub fn remove_callback(&mut self, id: u32) -> bool {
        match self.callbacks.remove(&id) {
            Some(mut callback) => {
                callback.unregister(id);
                true
            }
            None => false,
        }
    }

    pub fn get_by_id_mut(&mut self, id: u32) -> Option<&mut Box<T>> {
        self.callbacks.get_mut(&id)
    }

    pub fn for_all_callbacks<F: FnMut(&mut Box<T>)>(&mut self, mut f: F) {
        for (_, callback) in self.callbacks.iter_mut() {
            f(callback);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stack;

    struct TestCallback {
        value: u32,
    }

    impl RPCProxy for TestCallback {}

    #[test]
    fn test_capacity_and_cookies() {
        let (tx, _rx) = Stack::create_channel();
        let mut callbacks: Callbacks<TestCallback> =
            Callbacks::new(2, tx, Message::AdapterCallbackDisconnected);

        let id1 = callbacks.add_callback(Box::new(TestCallback { value: 1 })).unwrap();
        let id2 = callbacks.add_callback(Box::new(TestCallback { value: 2 })).unwrap();
        assert_ne!(id1, id2);
        assert!(callbacks.add_callback(Box::new(TestCallback { value: 3 })).is_none());

        assert!(callbacks.remove_callback(id1));
        assert!(!callbacks.remove_callback(id1));
        assert_eq!(callbacks.len(), 1);

        let mut sum = 0;
        callbacks.for_all_callbacks(|cb| sum += cb.value);
        assert_eq!(sum, 2);

        // The freed capacity is usable again and the cookie is fresh.
        let id3 = callbacks.add_callback(Box::new(TestCallback { value: 3 })).unwrap();
        assert_ne!(id3, id1);
        assert_ne!(id3, id2);
    }
}
