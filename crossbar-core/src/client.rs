//! In-process exchange participant.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::error::ExchangeError;
use crate::exchange::{Exchange, ExchangePeer, PeerKey};
use crate::qid::Qid;

/// Callbacks of a local participant.
pub trait LocalEvents {
    fn on_connected(&mut self, _client: &LocalClient) {}
    fn on_disconnected(&mut self, _client: &LocalClient) {}
    fn on_message(&mut self, _client: &LocalClient, _qid: &Bytes, _message: &Bytes) {}
}

enum Event {
    Connected,
    Disconnected,
    Message(Bytes, Bytes),
}

struct State {
    attachment: Option<(Exchange, PeerKey)>,
    queue: VecDeque<Event>,
    draining: bool,
}

struct Shared {
    state: RefCell<State>,
    delegate: RefCell<Box<dyn LocalEvents>>,
}

/// A client attached directly to an in-process exchange.
///
/// Cloning yields another handle to the same participant. Delegate
/// callbacks are drained from a queue rather than invoked recursively, so
/// a delegate that publishes to a qid it subscribes to, or disconnects
/// from inside `on_message`, iterates instead of re-entering itself.
#[derive(Clone)]
pub struct LocalClient {
    shared: Rc<Shared>,
}

impl LocalClient {
    #[must_use]
    pub fn new(delegate: Box<dyn LocalEvents>) -> Self {
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(State {
                    attachment: None,
                    queue: VecDeque::new(),
                    draining: false,
                }),
                delegate: RefCell::new(delegate),
            }),
        }
    }

    /// Attach to an exchange. Rejected when already attached.
    pub fn connect(&self, exchange: &Exchange) -> Result<(), ExchangeError> {
        {
            let state = self.shared.state.borrow();
            if state.attachment.is_some() {
                return Err(ExchangeError::AlreadyConnected);
            }
        }
        let peer = Rc::new(PeerHandle {
            shared: Rc::downgrade(&self.shared),
        });
        let key = exchange.connect(peer);
        self.shared.state.borrow_mut().attachment = Some((exchange.clone(), key));
        push_event(&self.shared, Event::Connected);
        Ok(())
    }

    /// Detach from the exchange, dropping all subscriptions.
    pub fn disconnect(&self) -> Result<(), ExchangeError> {
        let (exchange, key) = self
            .shared
            .state
            .borrow_mut()
            .attachment
            .take()
            .ok_or(ExchangeError::NotConnected)?;
        exchange.disconnect(key);
        push_event(&self.shared, Event::Disconnected);
        Ok(())
    }

    pub fn subscribe(&self, qid: Qid) -> Result<(), ExchangeError> {
        let (exchange, key) = self.attachment()?;
        exchange.subscribe(key, qid)
    }

    pub fn unsubscribe(&self, qid: &Qid) -> Result<(), ExchangeError> {
        let (exchange, key) = self.attachment()?;
        exchange.unsubscribe(key, qid)
    }

    /// Publish to a literal qid.
    pub fn send(
        &self,
        qid: impl Into<Bytes>,
        message: impl Into<Bytes>,
        multicast: bool,
    ) -> Result<(), ExchangeError> {
        let (exchange, _) = self.attachment()?;
        exchange.dispatch(&qid.into(), &message.into(), multicast);
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().attachment.is_some()
    }

    fn attachment(&self) -> Result<(Exchange, PeerKey), ExchangeError> {
        self.shared
            .state
            .borrow()
            .attachment
            .as_ref()
            .map(|(e, k)| (e.clone(), *k))
            .ok_or(ExchangeError::NotConnected)
    }
}

/// Queue an event and, unless a drain is already running further up the
/// stack, drain until the queue is empty. The delegate is only ever
/// borrowed for the duration of a single callback.
fn push_event(shared: &Rc<Shared>, event: Event) {
    {
        let mut state = shared.state.borrow_mut();
        state.queue.push_back(event);
        if state.draining {
            return;
        }
        state.draining = true;
    }

    let client = LocalClient {
        shared: Rc::clone(shared),
    };
    loop {
        let next = {
            let mut state = shared.state.borrow_mut();
            let next = state.queue.pop_front();
            if next.is_none() {
                state.draining = false;
            }
            next
        };
        let Some(event) = next else { break };
        let mut delegate = shared.delegate.borrow_mut();
        match event {
            Event::Connected => delegate.on_connected(&client),
            Event::Disconnected => delegate.on_disconnected(&client),
            Event::Message(qid, message) => delegate.on_message(&client, &qid, &message),
        }
    }
}

struct PeerHandle {
    shared: Weak<Shared>,
}

impl ExchangePeer for PeerHandle {
    fn deliver(&self, qid: &Bytes, message: &Bytes) {
        if let Some(shared) = self.shared.upgrade() {
            push_event(&shared, Event::Message(qid.clone(), message.clone()));
        }
    }

    fn hangup(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let client = LocalClient { shared };
            let _ = client.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Echo {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl LocalEvents for Echo {
        fn on_connected(&mut self, client: &LocalClient) {
            self.log.borrow_mut().push("connected".into());
            client.subscribe(Qid::literal("/loop")).unwrap();
        }

        fn on_disconnected(&mut self, _client: &LocalClient) {
            self.log.borrow_mut().push("disconnected".into());
        }

        fn on_message(&mut self, client: &LocalClient, _qid: &Bytes, message: &Bytes) {
            self.log
                .borrow_mut()
                .push(format!("msg:{}", String::from_utf8_lossy(message)));
            if message.as_ref() == b"again" {
                // Publish to ourselves from inside the callback: must not
                // recurse into the delegate.
                client.send("/loop", "done", true).unwrap();
            } else if message.as_ref() == b"done" {
                client.disconnect().unwrap();
            }
        }
    }

    #[test]
    fn self_publish_and_disconnect_inside_callbacks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let exchange = Exchange::with_seed(1);
        let client = LocalClient::new(Box::new(Echo { log: Rc::clone(&log) }));

        client.connect(&exchange).unwrap();
        client.send("/loop", "again", true).unwrap();

        assert_eq!(
            log.borrow().as_slice(),
            &["connected", "msg:again", "msg:done", "disconnected"]
        );
        assert!(!client.is_connected());
        assert_eq!(exchange.client_count(), 0);
    }

    #[test]
    fn operations_require_connection() {
        let client = LocalClient::new(Box::new(Echo::default()));
        assert!(matches!(
            client.subscribe(Qid::literal("/q")),
            Err(ExchangeError::NotConnected)
        ));
        assert!(matches!(
            client.send("/q", "m", true),
            Err(ExchangeError::NotConnected)
        ));
        assert!(matches!(client.disconnect(), Err(ExchangeError::NotConnected)));

        let exchange = Exchange::with_seed(1);
        client.connect(&exchange).unwrap();
        assert!(matches!(
            client.connect(&exchange),
            Err(ExchangeError::AlreadyConnected)
        ));
    }

    #[test]
    fn two_local_clients_roundtrip() {
        struct Sink {
            got: Rc<RefCell<Vec<(Bytes, Bytes)>>>,
        }
        impl LocalEvents for Sink {
            fn on_message(&mut self, _client: &LocalClient, qid: &Bytes, message: &Bytes) {
                self.got.borrow_mut().push((qid.clone(), message.clone()));
            }
        }

        let got = Rc::new(RefCell::new(Vec::new()));
        let exchange = Exchange::with_seed(1);
        let a = LocalClient::new(Box::new(Sink { got: Rc::clone(&got) }));
        a.connect(&exchange).unwrap();
        a.subscribe(Qid::pattern("/room/.*").unwrap()).unwrap();

        let b = LocalClient::new(Box::new(Echo::default()));
        b.connect(&exchange).unwrap();
        b.send("/room/42", "hi", true).unwrap();

        let got = got.borrow();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.as_ref(), b"/room/42");
        assert_eq!(got[0].1.as_ref(), b"hi");
    }
}
