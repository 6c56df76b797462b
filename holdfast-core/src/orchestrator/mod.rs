//! Worker-fleet management for the thread-per-core accept path.
//!
//! The control thread owns a [`WorkerManager`] that spawns N worker threads,
//! each running a [`ServiceExecutor`] inside its own runtime. Listener
//! lifecycle actions travel to every worker as [`ServiceCommand`]s; each
//! worker acquires its listen socket through the listener's shared
//! [`ListenSocketFactory`](crate::net::ListenSocketFactory) and runs the
//! accept loop until told to drain.

use std::{fmt::Debug, rc::Rc};

use futures_channel::oneshot::Sender as OSender;
use monoio::io::stream::Stream;
use service_async::Service;
use tracing::{debug, error, info, warn};

use self::runtime::RuntimeWrapper;

mod runtime;
mod service_executor;
mod worker_listener;
mod worker_manager;

pub use service_executor::{
    CommandError, Execute, ServiceCommand, ServiceCommandTask, ServiceExecutor,
};
pub use worker_listener::{Accepted, AcceptedAddr, AcceptedStream, WorkerListener};
pub use worker_manager::{JoinHandlesWithOutput, WorkerManager};

/// A collection of results from dispatching one command to every worker.
pub struct ResultGroup<T, E>(Vec<Result<T, E>>);

impl<T, E> From<Vec<Result<T, E>>> for ResultGroup<T, E> {
    fn from(value: Vec<Result<T, E>>) -> Self {
        Self(value)
    }
}

impl<T, E> From<ResultGroup<T, E>> for Vec<Result<T, E>> {
    fn from(value: ResultGroup<T, E>) -> Self {
        value.0
    }
}

impl<E> ResultGroup<(), E> {
    pub fn err(self) -> Result<(), E> {
        for r in self.0.into_iter() {
            r?;
        }
        Ok(())
    }
}

/// Accept loop for one listener on one worker.
///
/// Runs until the executor drops the paired receiver (listener drained or
/// removed) or the listener closes. Established connections are served on
/// their own tasks and are unaffected by the loop stopping.
pub async fn serve<S, Svc, A, E>(mut listener: S, handler: Rc<Svc>, mut stop: OSender<()>)
where
    S: Stream<Item = Result<A, E>> + 'static,
    E: Debug,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    let mut cancellation = stop.cancellation();
    loop {
        monoio::select! {
            _ = &mut cancellation => {
                info!("listener is notified to stop accepting");
                break;
            }
            accept_opt = listener.next() => {
                let accept = match accept_opt {
                    Some(accept) => accept,
                    None => {
                        info!("listener is closed, serve stopped");
                        return;
                    }
                };
                match accept {
                    Ok(accept) => {
                        let svc = handler.clone();
                        monoio::spawn(async move {
                            match svc.call(accept).await {
                                Ok(_) => {
                                    debug!("connection complete");
                                }
                                Err(e) => {
                                    error!("connection error: {e:?}");
                                }
                            }
                        });
                    }
                    Err(e) => warn!("accept connection failed: {e:?}"),
                }
            }
        }
    }
}
