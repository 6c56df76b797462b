//! Per-worker listener deployment.
//!
//! A [`ServiceExecutor`] runs inside each worker thread and processes
//! [`ServiceCommand`]s: it builds the connection service, acquires this
//! worker's listen socket through the shared factory, and owns the accept
//! loop's stop handle. Deployments are replaced whole; a config change ships
//! a new listener rather than mutating the running one.

use std::{cell::UnsafeCell, collections::HashMap, fmt::Debug, rc::Rc, sync::Arc};

use futures_channel::{
    mpsc::Receiver,
    oneshot::{channel as ochannel, Receiver as OReceiver, Sender as OSender},
};
use futures_util::stream::StreamExt;
use service_async::{AsyncMakeService, Service};
use tracing::error;

use super::{serve, Accepted, WorkerListener};
use crate::{net::ListenSocketFactory, AnyError, ConfigError};

/// Tracks every listener deployed to one worker thread.
///
/// Single-threaded by construction (one executor per worker runtime), which
/// is what makes the interior `UnsafeCell` sound: commands are processed one
/// at a time on this worker.
pub struct ServiceExecutor<S> {
    sites: Rc<UnsafeCell<HashMap<Arc<String>, ListenerDeployment<S>>>>,
}

impl<S> Default for ServiceExecutor<S> {
    fn default() -> Self {
        Self {
            sites: Rc::new(UnsafeCell::new(HashMap::new())),
        }
    }
}

struct ListenerDeployment<S> {
    handler: Rc<S>,
    /// Paired with the accept loop's sender; dropping it stops the loop.
    accept_guard: Option<OReceiver<()>>,
}

impl<S> ServiceExecutor<S> {
    fn deploy(&self, name: Arc<String>, handler: Rc<S>, accept_guard: OReceiver<()>) {
        let sites = unsafe { &mut *self.sites.get() };
        // Replacing an existing deployment drops its guard, which cancels
        // the superseded accept loop.
        sites.insert(
            name,
            ListenerDeployment {
                handler,
                accept_guard: Some(accept_guard),
            },
        );
    }

    fn stop_accepting(&self, name: &Arc<String>) -> Result<(), ServiceCommandError> {
        let sites = unsafe { &mut *self.sites.get() };
        let site = sites.get_mut(name).ok_or(ServiceCommandError::SiteLookupFailed)?;
        site.accept_guard = None;
        Ok(())
    }

    fn remove(&self, name: &Arc<String>) -> Result<(), ServiceCommandError> {
        let sites = unsafe { &mut *self.sites.get() };
        if sites.remove(name).is_none() {
            Err(ServiceCommandError::SiteLookupFailed)
        } else {
            Ok(())
        }
    }
}

enum ServiceCommandError {
    SiteLookupFailed,
}

/// Listener lifecycle actions broadcast to every worker.
#[derive(Clone)]
pub enum ServiceCommand<F> {
    /// Build the connection service with `F`, acquire this worker's socket
    /// from the listener's factory and start accepting.
    Start(Arc<String>, F, Arc<ListenSocketFactory>),
    /// Stop accepting while the listener drains; established connections
    /// keep running.
    Drain(Arc<String>),
    /// Drop the deployment entirely.
    Remove(Arc<String>),
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError<SE> {
    #[error("build service error: {0:?}")]
    BuildService(SE),
    #[error("build listener error: {0:?}")]
    BuildListener(ConfigError),
    #[error("site not exist")]
    SiteNotExist,
}

impl<SE> From<ServiceCommandError> for CommandError<SE> {
    fn from(value: ServiceCommandError) -> Self {
        match value {
            ServiceCommandError::SiteLookupFailed => Self::SiteNotExist,
        }
    }
}

/// A [`ServiceCommand`] paired with the channel its result travels back on.
pub struct ServiceCommandTask<F> {
    cmd: ServiceCommand<F>,
    result: OSender<Result<(), AnyError>>,
}

impl<F> ServiceCommandTask<F> {
    pub fn new(cmd: ServiceCommand<F>) -> (Self, OReceiver<Result<(), AnyError>>) {
        let (tx, rx) = ochannel();
        (Self { cmd, result: tx }, rx)
    }
}

/// Executing a service command against a worker's executor.
pub trait Execute<S> {
    type Error: Into<AnyError>;
    fn execute(
        self,
        executor: &ServiceExecutor<S>,
    ) -> impl std::future::Future<Output = Result<(), Self::Error>>;
}

impl<F, S> Execute<S> for ServiceCommand<F>
where
    F: AsyncMakeService<Service = S>,
    F::Error: Debug + Send + Sync + 'static,
    S: Service<Accepted> + 'static,
    S::Error: Debug,
{
    type Error = CommandError<F::Error>;

    async fn execute(self, executor: &ServiceExecutor<S>) -> Result<(), Self::Error> {
        match self {
            ServiceCommand::Start(name, factory, socket_factory) => {
                let svc = factory.make().await.map_err(CommandError::BuildService)?;
                let listener =
                    WorkerListener::build(&socket_factory).map_err(CommandError::BuildListener)?;
                let handler = Rc::new(svc);
                let (stop_tx, stop_rx) = ochannel();
                executor.deploy(name, handler.clone(), stop_rx);
                monoio::spawn(serve(listener, handler, stop_tx));
                Ok(())
            }
            ServiceCommand::Drain(name) => {
                executor.stop_accepting(&name)?;
                Ok(())
            }
            ServiceCommand::Remove(name) => {
                executor.remove(&name)?;
                Ok(())
            }
        }
    }
}

impl<S> ServiceExecutor<S> {
    /// Worker control loop: process commands until the channel closes.
    pub async fn run<F>(&self, mut rx: Receiver<ServiceCommandTask<F>>)
    where
        ServiceCommand<F>: Execute<S>,
    {
        while let Some(task) = rx.next().await {
            if let Err(e) = task
                .result
                .send(task.cmd.execute(self).await.map_err(Into::into))
            {
                error!("unable to send back result: {e:?}");
            }
        }
    }
}
