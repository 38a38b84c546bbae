use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

use crate::host::{GpuProcessHostRegistry, GpuProcessKind, HostId};

/// Endpoint of an established GPU channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct ChannelHandle {
    pub host: HostId,
    pub client_id: u64,
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum ChannelError {
    #[error("GPU access is blocked")]
    GpuAccessBlocked,
    #[error("GPU process host {0} went away")]
    HostLost(HostId),
    #[error("cannot {0} in the current request state")]
    InvalidTransition(&'static str),
}

pub type ChannelOutcome = Result<ChannelHandle, ChannelError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EstablishState {
    Created,
    Dispatched(HostId),
    ChannelEstablished(ChannelHandle),
    Failed(ChannelError),
    Finished,
}

/// One request from a client process for a channel to the GPU process.
///
/// The request has a single owner which drives it through
/// `Created -> Dispatched -> ChannelEstablished | Failed -> Finished`.
/// A failure caused by the GPU process going away is retried once on the
/// replacement host. Cancelling drops the completion callback; later events
/// are ignored.
pub struct EstablishChannelRequest {
    client_id: u64,
    kind: GpuProcessKind,
    state: EstablishState,
    retried: bool,
    cancelled: bool,
    on_finished: Option<Box<dyn FnOnce(ChannelOutcome)>>,
}

impl EstablishChannelRequest {
    pub fn new<F>(client_id: u64, kind: GpuProcessKind, on_finished: F) -> Self
    where
        F: FnOnce(ChannelOutcome) + 'static,
    {
        Self {
            client_id,
            kind,
            state: EstablishState::Created,
            retried: false,
            cancelled: false,
            on_finished: Some(Box::new(on_finished)),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn state(&self) -> EstablishState {
        self.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.state == EstablishState::Finished
    }

    /// Sends the request to the GPU process host for this request's kind.
    pub fn dispatch(&mut self, registry: &mut GpuProcessHostRegistry) -> Result<HostId, ChannelError> {
        if self.state != EstablishState::Created || self.cancelled {
            return Err(ChannelError::InvalidTransition("dispatch"));
        }
        match registry.get_or_create(self.kind) {
            Some(host) => {
                debug!("channel request for client {} dispatched to host {host}", self.client_id);
                self.state = EstablishState::Dispatched(host);
                Ok(host)
            }
            None => {
                self.state = EstablishState::Failed(ChannelError::GpuAccessBlocked);
                Err(ChannelError::GpuAccessBlocked)
            }
        }
    }

    pub fn on_channel_established(&mut self, handle: ChannelHandle) -> Result<(), ChannelError> {
        if self.cancelled {
            return Ok(());
        }
        match self.state {
            EstablishState::Dispatched(host) if host == handle.host => {
                self.state = EstablishState::ChannelEstablished(handle);
                Ok(())
            }
            _ => Err(ChannelError::InvalidTransition("accept a channel")),
        }
    }

    /// Handles a failed attempt. Retries once if the host died meanwhile.
    pub fn on_establish_failed(
        &mut self,
        registry: &mut GpuProcessHostRegistry,
    ) -> Result<(), ChannelError> {
        if self.cancelled {
            return Ok(());
        }
        let EstablishState::Dispatched(host) = self.state else {
            return Err(ChannelError::InvalidTransition("fail"));
        };

        let host_alive = registry.from_id(host).map(|h| h.is_valid()).unwrap_or(false);
        if !host_alive && !self.retried {
            warn!(
                "GPU process host {host} went away while establishing a channel for client {}; retrying",
                self.client_id
            );
            self.retried = true;
            self.state = EstablishState::Created;
            return self.dispatch(registry).map(|_| ());
        }

        self.state = EstablishState::Failed(ChannelError::HostLost(host));
        Ok(())
    }

    /// Drops the completion callback; the request will never report.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.on_finished = None;
    }

    /// Reports the outcome. Returns `true` if the callback ran.
    pub fn finish(&mut self) -> Result<bool, ChannelError> {
        let outcome = match self.state {
            EstablishState::ChannelEstablished(handle) => Ok(handle),
            EstablishState::Failed(err) => Err(err),
            _ if self.cancelled => {
                self.state = EstablishState::Finished;
                return Ok(false);
            }
            _ => return Err(ChannelError::InvalidTransition("finish")),
        };
        self.state = EstablishState::Finished;

        match self.on_finished.take() {
            Some(callback) => {
                callback(outcome);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
