//! End-to-end worker fleet: deploy a listener to multiple workers, exchange
//! bytes with it, then drain it.

use std::{
    convert::Infallible,
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
};

use holdfast_core::{
    config::RuntimeConfig,
    net::{ListenAddress, ListenSocketFactory, SocketType},
    orchestrator::{Accepted, ServiceCommand, WorkerManager},
};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use service_async::{AsyncMakeService, MakeService, Service};

struct EchoService;

impl Service<Accepted> for EchoService {
    type Response = ();
    type Error = std::io::Error;

    async fn call(&self, (mut stream, _addr): Accepted) -> Result<(), std::io::Error> {
        let mut buffer = Vec::with_capacity(1024);
        loop {
            let (mut r, buf) = stream.read(buffer).await;
            if r? == 0 {
                break;
            }
            (r, buffer) = stream.write_all(buf).await;
            r?;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct EchoFactory;

impl MakeService for EchoFactory {
    type Service = EchoService;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(EchoService)
    }
}

impl AsyncMakeService for EchoFactory {
    type Service = EchoService;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(EchoService)
    }
}

#[monoio::test(timer_enabled = true)]
async fn workers_share_one_socket_and_echo() {
    let runtime_config = RuntimeConfig {
        worker_threads: 2,
        cpu_affinity: false,
        ..Default::default()
    };
    let mut manager = WorkerManager::<EchoFactory>::new(runtime_config);
    let handles = manager.spawn_workers();
    assert_eq!(handles.len(), 2);

    let factory = Arc::new(
        ListenSocketFactory::new(
            ListenAddress::Ip("127.0.0.1:0".parse().unwrap()),
            SocketType::Stream,
            Vec::new(),
            true,
            "echo".to_string(),
            false,
            None,
        )
        .unwrap(),
    );
    let address = factory.local_address().socket_addr().unwrap();

    let name = Arc::new("echo".to_string());
    manager
        .dispatch_service_command(ServiceCommand::Start(
            name.clone(),
            EchoFactory,
            factory.clone(),
        ))
        .await
        .err()
        .unwrap();

    // Both workers accept from the same underlying socket.
    for _ in 0..4 {
        let mut client = TcpStream::connect(address).unwrap();
        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");
    }

    manager
        .dispatch_service_command(ServiceCommand::Drain(name.clone()))
        .await
        .err()
        .unwrap();
    manager
        .dispatch_service_command(ServiceCommand::Remove(name))
        .await
        .err()
        .unwrap();

    drop(manager);
    for (handle, _stop) in handles {
        let _ = handle.join();
    }
}
