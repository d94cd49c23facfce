//! The typed channel triple connecting the driver, a worker, and the
//! notification router.
//!
//! Contract: the driver sends every config and drops `configs_in`; the worker
//! drops its success sender first and its notification sender second on every
//! exit path, so consumers always observe success-out closing before
//! notifications-out.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::service::ServiceConfig;
use crate::types::{Notification, ServiceName};

/// One `(service, ok)` verdict per config a worker consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub service: ServiceName,
    pub ok: bool,
}

/// The worker-held ends of the triple.
#[derive(Debug)]
pub struct WorkerEnds {
    pub configs: mpsc::Receiver<Arc<ServiceConfig>>,
    pub success: mpsc::Sender<StageOutcome>,
    pub notifications: mpsc::Sender<Notification>,
}

/// The driver/router-held ends of the triple.
#[derive(Debug)]
pub struct WorkerChannels {
    pub configs_in: mpsc::Sender<Arc<ServiceConfig>>,
    pub success_out: mpsc::Receiver<StageOutcome>,
    pub notifications_out: mpsc::Receiver<Notification>,
    pub worker: WorkerEnds,
}

impl WorkerChannels {
    /// Build the triple. Configs-in and success-out hold `max(buffer, 1)`
    /// messages so the driver can enqueue a whole batch without the worker
    /// running yet; notifications-out stays at the minimum capacity so
    /// producers rendezvous with the router.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1);
        let (configs_in, configs) = mpsc::channel(buffer);
        let (success, success_out) = mpsc::channel(buffer);
        let (notifications, notifications_out) = mpsc::channel(1);

        Self {
            configs_in,
            success_out,
            notifications_out,
            worker: WorkerEnds {
                configs,
                success,
                notifications,
            },
        }
    }
}
