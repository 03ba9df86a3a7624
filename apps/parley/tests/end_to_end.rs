use std::sync::Arc;
use std::time::Duration;

use parley_client_core::config::ClientConfig;
use parley_client_core::gateway::GatewayClient;
use parley_client_core::otr::OtrState;
use parley_client_core::peer::{IncomingState, OutgoingState, PeerConnector};
use parley_client_core::rtc::{LoopbackFactory, RtcConfig};
use parley_gateway::GatewayConfig;
use parley_proto::PersonalIdentity;
use test_timeout::tokio_timeout_test;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connector(url: &str, factory: &LoopbackFactory) -> PeerConnector {
    let config = ClientConfig {
        gateway_url: url.to_string(),
        peer_request_timeout: Duration::from_secs(5),
        ake_timeout: Duration::from_secs(5),
        rtc: RtcConfig::host_only(),
        ..ClientConfig::default()
    };
    let gateway = GatewayClient::connect(&config, Arc::new(PersonalIdentity::generate()))
        .await
        .expect("gateway connect");
    gateway.wait_connected().await.expect("gateway auth");
    PeerConnector::new(gateway, Arc::new(factory.clone()), config)
}

#[tokio_timeout_test(30)]
async fn request_accept_and_exchange_encrypted_messages() {
    init_tracing();
    let gateway = parley_gateway::spawn_local(GatewayConfig::default())
        .await
        .expect("gateway");
    let factory = LoopbackFactory::new();
    let alice = connector(&gateway.ws_url(), &factory).await;
    let bob = connector(&gateway.ws_url(), &factory).await;
    let mut requests = bob.incoming();

    let outgoing = alice
        .request(bob.gateway().fingerprint())
        .await
        .expect("request");
    let incoming = requests.next().await.expect("incoming request");
    assert_eq!(incoming.connection_id(), outgoing.connection_id());
    incoming.accept().await.expect("accept");

    assert_eq!(outgoing.wait_for_outcome().await, OutgoingState::Connected);
    assert_eq!(incoming.wait_for_outcome().await, IncomingState::Connected);

    let (alice_secure, bob_secure) = tokio::join!(outgoing.secure(), incoming.secure());
    let alice_secure = alice_secure.expect("alice key exchange");
    let bob_secure = bob_secure.expect("bob key exchange");
    assert_eq!(alice_secure.state(), OtrState::Connected);
    assert_eq!(alice_secure.session().ssid(), bob_secure.session().ssid());
    assert_eq!(
        alice_secure.peer().map(|peer| peer.fingerprint()),
        Some(bob.gateway().fingerprint())
    );
    assert_eq!(
        bob_secure.peer().map(|peer| peer.fingerprint()),
        Some(alice.gateway().fingerprint())
    );

    alice_secure.send(b"hello").await.expect("send");
    assert_eq!(bob_secure.recv().await.expect("recv"), b"hello");
    bob_secure.send(b"hi alice").await.expect("reply");
    assert_eq!(alice_secure.recv().await.expect("recv reply"), b"hi alice");

    // Several rounds so both sides rotate keys.
    for round in 0..4u8 {
        alice_secure.send(&[round]).await.expect("send round");
        assert_eq!(bob_secure.recv().await.expect("recv round"), vec![round]);
        bob_secure.send(&[round, round]).await.expect("reply round");
        assert_eq!(alice_secure.recv().await.expect("recv reply round"), vec![round, round]);
    }

    alice_secure.close().await;
    assert!(bob_secure.recv().await.is_err());
    assert_eq!(bob_secure.state(), OtrState::Closed);

    gateway.shutdown().await.expect("shutdown");
}

#[tokio_timeout_test(20)]
async fn target_going_offline_before_answering_is_reported() {
    init_tracing();
    let gateway = parley_gateway::spawn_local(GatewayConfig::default())
        .await
        .expect("gateway");
    let factory = LoopbackFactory::new();
    let alice = connector(&gateway.ws_url(), &factory).await;
    let bob = connector(&gateway.ws_url(), &factory).await;
    let mut requests = bob.incoming();

    let outgoing = alice
        .request(bob.gateway().fingerprint())
        .await
        .expect("request");
    let _incoming = requests.next().await.expect("incoming request");
    bob.gateway().close();

    assert_eq!(outgoing.wait_for_outcome().await, OutgoingState::PeerOffline);
}
