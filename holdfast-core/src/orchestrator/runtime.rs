use std::future::Future;

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{
    blocking::ThreadPool, time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder,
};

use crate::config::{RuntimeConfig, RuntimeType, MIN_SQPOLL_IDLE_TIME};

pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl RuntimeWrapper {
    pub fn new(
        config: &RuntimeConfig,
        thread_pool: Option<Box<dyn ThreadPool + Send + 'static>>,
    ) -> Self {
        #[cfg(target_os = "linux")]
        let runtime_type =
            if config.runtime_type == RuntimeType::IoUring && monoio::utils::detect_uring() {
                RuntimeType::IoUring
            } else {
                RuntimeType::Legacy
            };
        #[cfg(not(target_os = "linux"))]
        let runtime_type = RuntimeType::Legacy;

        match runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => {
                let builder = match config.sqpoll_idle {
                    Some(idle) => {
                        let builder = RuntimeBuilder::<monoio::IoUringDriver>::new();
                        let idle = MIN_SQPOLL_IDLE_TIME.max(idle);
                        let mut uring_builder = io_uring::IoUring::builder();
                        uring_builder.setup_sqpoll(idle);
                        builder.uring_builder(uring_builder)
                    }
                    None => RuntimeBuilder::<monoio::IoUringDriver>::new(),
                };
                let mut builder = builder.enable_timer().with_entries(config.entries);
                if let Some(tp) = thread_pool {
                    builder = builder.attach_thread_pool(tp);
                }
                RuntimeWrapper::IoUring(builder.build().expect("build io_uring runtime failed"))
            }
            RuntimeType::Legacy => {
                let mut builder = RuntimeBuilder::<monoio::LegacyDriver>::new().enable_timer();
                if let Some(tp) = thread_pool {
                    builder = builder.attach_thread_pool(tp);
                }
                RuntimeWrapper::Legacy(builder.build().expect("build legacy runtime failed"))
            }
        }
    }

    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}
