//! Tokio driver for a [`Stack`].
//!
//! [`StackHandle`] puts the stack behind one `tokio::sync::Mutex` and runs two
//! background tasks on it: a ticker that fires transaction timers and a
//! poller that drains the datalink. Confirmed requests can then be awaited
//! with [`StackHandle::request`].
//!
//! ```no_run
//! use std::time::Duration;
//! use bacnet_tsm::config::StackConfig;
//! use bacnet_tsm::datalink::{DataLinkAddress, MemoryNetwork};
//! use bacnet_tsm::driver::{DriverConfig, StackHandle};
//! use bacnet_tsm::stack::Stack;
//!
//! # async fn run() -> bacnet_tsm::stack::Result<()> {
//! let network = MemoryNetwork::new();
//! let stack = Stack::new(StackConfig::default(), network.attach(DataLinkAddress::MsTP(1)))?;
//! let handle = StackHandle::spawn(stack, DriverConfig::default());
//!
//! let outcome = handle.request(2000, 12, vec![0x0C, 0x02, 0x00, 0x07, 0xD0]).await?;
//! println!("{:?}", outcome);
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::app::Outcome;
use crate::datalink::DataLink;
use crate::network::Route;
use crate::service::Segmentation;
use crate::stack::{ConfirmedRequest, Result, Stack};

/// Task periods of a [`StackHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriverConfig {
    /// Period of the timer task
    pub tick_interval: Duration,
    /// Period of the datalink polling task
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Shared, task-driven [`Stack`]
#[derive(Debug)]
pub struct StackHandle<D: DataLink + 'static> {
    stack: Arc<Mutex<Stack<D>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<D: DataLink + 'static> StackHandle<D> {
    /// Move `stack` behind a mutex and start the ticker and poller tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(stack: Stack<D>, config: DriverConfig) -> Self {
        let stack = Arc::new(Mutex::new(stack));

        let ticker = {
            let stack = stack.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(config.tick_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let now = Instant::now().into_std();
                    let mut stack = stack.lock().await;
                    stack.tick(now);
                    stack.unbind_expired(now);
                }
            })
        };

        let poller = {
            let stack = stack.clone();
            tokio::spawn(async move {
                let mut interval = time::interval(config.poll_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let now = Instant::now().into_std();
                    if let Err(err) = stack.lock().await.poll(now) {
                        warn!("datalink receive failed: {}", err);
                    }
                }
            })
        };

        debug!(
            "stack driver started (tick {:?}, poll {:?})",
            config.tick_interval, config.poll_interval
        );
        Self {
            stack,
            tasks: vec![ticker, poller],
        }
    }

    /// The shared stack, for registering handlers or direct calls
    pub fn stack(&self) -> Arc<Mutex<Stack<D>>> {
        self.stack.clone()
    }

    /// Send a confirmed request with the configured retry limit and timeout,
    /// and wait for its outcome.
    pub async fn request(&self, device_instance: u32, service_choice: u8, payload: Vec<u8>) -> Result<Outcome> {
        let (retry_limit, timeout) = {
            let stack = self.stack.lock().await;
            (stack.config().apdu_retries, stack.config().apdu_timeout)
        };
        self.request_with(
            device_instance,
            ConfirmedRequest::new(service_choice, payload, retry_limit, timeout),
        )
        .await
    }

    /// Send `request` to a device and wait for its outcome.
    ///
    /// Any callback already set on `request` is replaced.
    pub async fn request_with(&self, device_instance: u32, request: ConfirmedRequest) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        let request = request.with_callback(move |_, outcome| {
            let _ = tx.send(outcome);
        });

        self.stack
            .lock()
            .await
            .send_request(device_instance, request, Instant::now().into_std())?;
        Ok(rx.await.unwrap_or(Outcome::Cancelled))
    }

    /// Send `request` along an explicit route and wait for its outcome
    pub async fn request_to_route(
        &self,
        route: Route,
        max_apdu: usize,
        segmentation: Segmentation,
        request: ConfirmedRequest,
    ) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        let request = request.with_callback(move |_, outcome| {
            let _ = tx.send(outcome);
        });

        self.stack.lock().await.send_request_to_route(
            route,
            max_apdu,
            segmentation,
            request,
            Instant::now().into_std(),
        )?;
        Ok(rx.await.unwrap_or(Outcome::Cancelled))
    }

    /// Stop the background tasks
    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        debug!("stack driver stopped");
    }
}

impl<D: DataLink + 'static> Drop for StackHandle<D> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::datalink::{DataLinkAddress, MemoryDataLink, MemoryNetwork};
    use crate::service::{RequestContext, ServiceResponse};
    use crate::stack::StackError;
    use tokio_test::{assert_err, assert_ok};

    const READ_PROPERTY: u8 = 12;
    const CLIENT: DataLinkAddress = DataLinkAddress::MsTP(1);
    const SERVER: DataLinkAddress = DataLinkAddress::MsTP(2);

    fn stack(network: &MemoryNetwork, address: DataLinkAddress) -> Stack<MemoryDataLink> {
        let mut config = StackConfig::default();
        config.apdu_timeout = Duration::from_millis(500);
        config.apdu_retries = 2;
        Stack::new(config, network.attach(address)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_round_trip() {
        let network = MemoryNetwork::new();
        let mut server = stack(&network, SERVER);
        server.register_confirmed_handler(READ_PROPERTY, |_: u8, payload: &[u8], _: &RequestContext| {
            ServiceResponse::ComplexAck(payload.to_vec())
        });
        let mut client = stack(&network, CLIENT);
        client
            .bind_static(2000, Route::unicast(SERVER), 1476, Segmentation::Both)
            .unwrap();

        let server = StackHandle::spawn(server, DriverConfig::default());
        let client = StackHandle::spawn(client, DriverConfig::default());

        let outcome = assert_ok!(client.request(2000, READ_PROPERTY, vec![9, 8, 7]).await);
        assert_eq!(outcome, Outcome::Ack(vec![9, 8, 7]));

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_peer() {
        let network = MemoryNetwork::new();
        let client = stack(&network, CLIENT);
        let client = StackHandle::spawn(client, DriverConfig::default());

        let started = Instant::now();
        let outcome = assert_ok!(
            client
                .request_to_route(
                    Route::unicast(SERVER),
                    1476,
                    Segmentation::Both,
                    ConfirmedRequest::new(READ_PROPERTY, vec![], 2, Duration::from_millis(500)),
                )
                .await
        );
        assert_eq!(outcome, Outcome::Timeout);
        // Three attempts of 500 ms each
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(network.take_transmissions().len(), 3);
    }

    #[tokio::test]
    async fn test_unresolved_device() {
        let network = MemoryNetwork::new();
        let client = StackHandle::spawn(stack(&network, CLIENT), DriverConfig::default());

        let err = assert_err!(client.request(42, READ_PROPERTY, vec![]).await);
        assert!(matches!(err, StackError::Unresolved(42)));
        assert_eq!(client.stack().lock().await.statistics().who_is_sent, 1);
    }
}
