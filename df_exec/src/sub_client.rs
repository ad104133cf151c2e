//! # Subscriber Client
//!
//! Receives messages published on a single topic. A background thread waits on the socket and
//! stores incoming messages in a bounded queue, so that the control loop can take them without
//! ever blocking on the network. When the queue is full the oldest message is dropped, a queue of
//! capacity one therefore always holds the latest value.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, atomic::{AtomicBool, Ordering}},
    thread::{self, JoinHandle}
};
use log::{debug, error, warn};
use serde::de::DeserializeOwned;

use comms_if::net::{MonitoredSocket, MonitoredSocketError, SocketOptions, zmq};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Time the background thread waits for a message before checking if it should stop.
const POLL_TIMEOUT_MS: i64 = 10;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A client receiving messages of type `T` on one topic.
pub struct Subscriber<T> {
    topic: String,
    bg_jh: Option<JoinHandle<()>>,
    bg_run: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    queue: Arc<Mutex<VecDeque<T>>>
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("The queue capacity must be at least 1")]
    ZeroCapacity
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<T> Subscriber<T>
where
    T: DeserializeOwned + Send + 'static
{
    /// Connect a new subscriber to `endpoint`, receiving messages on `topic`.
    ///
    /// At most `capacity` messages are buffered between calls to `drain`.
    ///
    /// This function will not block until the publisher is found.
    pub fn new(
        ctx: &zmq::Context,
        endpoint: &str,
        topic: &str,
        capacity: usize
    ) -> Result<Self, SubscriberError> {
        if capacity == 0 {
            return Err(SubscriberError::ZeroCapacity)
        }

        let socket = MonitoredSocket::new(
            ctx,
            zmq::SUB,
            SocketOptions::subscriber(topic),
            endpoint
        ).map_err(SubscriberError::SocketError)?;

        let bg_run = Arc::new(AtomicBool::new(true));
        let connected = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));

        let bg_run_clone = bg_run.clone();
        let connected_clone = connected.clone();
        let queue_clone = queue.clone();
        let topic_clone = topic.to_string();

        let bg_jh = Some(thread::spawn(move || {
            bg_thread(
                socket,
                topic_clone,
                capacity,
                bg_run_clone,
                connected_clone,
                queue_clone
            )
        }));

        debug!("Subscribed to {} on {}", topic, endpoint);

        Ok(Self {
            topic: topic.to_string(),
            bg_jh,
            bg_run,
            connected,
            queue
        })
    }

    /// Take every message received since the last call, oldest first.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.queue).drain(..).collect()
    }

    /// Take the most recent message, discarding any older ones.
    pub fn latest(&self) -> Option<T> {
        let mut queue = lock(&self.queue);
        let last = queue.pop_back();
        queue.clear();

        last
    }

    /// Return true if the underlying socket is connected to a publisher.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.bg_run.store(false, Ordering::Relaxed);

        if let Some(jh) = self.bg_jh.take() {
            if jh.join().is_err() {
                error!("Subscriber thread for {} panicked", self.topic);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Lock the queue, recovering it if a previous holder panicked.
fn lock<T>(queue: &Mutex<VecDeque<T>>) -> MutexGuard<VecDeque<T>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Background thread, moves received messages into the queue until told to stop.
fn bg_thread<T: DeserializeOwned>(
    socket: MonitoredSocket,
    topic: String,
    capacity: usize,
    run: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    queue: Arc<Mutex<VecDeque<T>>>
) {
    let mut num_dropped: u64 = 0;

    while run.load(Ordering::Relaxed) {
        connected.store(socket.connected(), Ordering::Relaxed);

        match socket.poll(zmq::POLLIN, POLL_TIMEOUT_MS) {
            Ok(0) => continue,
            Ok(_) => (),
            Err(zmq::Error::EINTR) => continue,
            Err(e) => {
                error!("Error polling the {} socket: {}", topic, e);
                break
            }
        }

        let msgs: Vec<T> = match socket.recv_all(&topic) {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving on {}: {}", topic, e);
                continue
            }
        };

        let mut q = lock(&queue);
        for m in msgs {
            if q.len() >= capacity {
                q.pop_front();
                num_dropped += 1;

                // Expected for last-value queues
                if capacity > 1 {
                    warn!(
                        "Queue for {} is full, dropped the oldest message ({} dropped in total)",
                        topic, num_dropped
                    );
                }
            }
            q.push_back(m);
        }
    }
}
