mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use dnsgate::cache::{CachePolicy, ResponseCache, ResponseCacheConfig, default_vpn_cidrs};
use dnsgate::dns::{self, AnswerData, QueryType, rcode};
use dnsgate::engine::{EngineConfig, EngineHandle, FlowEngine};
use dnsgate::listen;
use dnsgate::rules::{Rule, RuleAction, RuleCache, RuleCacheConfig, RuleSource, RuleStore};
use dnsgate::stats::GateStats;
use dnsgate::upstream::RetryPolicy;

use common::{FakeResolver, query_wire};

async fn spawn_full_stack(upstream: Option<std::net::SocketAddr>) -> EngineHandle {
    let store = Arc::new(RuleStore::in_memory());
    let mut tx = store.begin_tx();
    tx.add([Rule::from_pattern("ads.example.com", RuleAction::Block, 0, RuleSource::User).unwrap()]);
    tx.commit().unwrap();

    let config = EngineConfig {
        upstreams: upstream.into_iter().collect(),
        chain_preservation: true,
        vpn_cidrs: default_vpn_cidrs(),
        cache_policy: CachePolicy::default(),
        retry: RetryPolicy::default(),
        connect_grace: Duration::from_millis(200),
        retry_delay: Duration::from_millis(50),
        pending_timeout: Duration::from_millis(500),
        cleanup_interval: Duration::from_millis(100),
        transition_capacity: 1000,
    };

    let (engine, _pool, _join) = FlowEngine::spawn(
        config,
        store,
        Arc::new(RuleCache::new(RuleCacheConfig::default())),
        Arc::new(ResponseCache::new(ResponseCacheConfig::default())),
        Arc::new(GateStats::new()),
    );
    engine.startup_complete().await;
    engine
}

#[tokio::test]
async fn udp_listener_blocks_over_real_sockets() {
    let engine = spawn_full_stack(None).await;
    let bound = listen::serve_udp(engine.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&query_wire(0x4242, "ads.example.com", QueryType::A), bound)
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = dns::decode_response(&buf[..len]).unwrap();
    assert_eq!(response.id, 0x4242);
    assert_eq!(
        response.answers,
        vec![AnswerData::Ipv4("127.0.0.1".parse().unwrap())]
    );
}

#[tokio::test]
async fn udp_listener_forwards_over_real_sockets() {
    let resolver = FakeResolver::spawn([203, 0, 113, 44], 60).await;
    let engine = spawn_full_stack(Some(resolver.addr)).await;
    let bound = listen::serve_udp(engine.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&query_wire(0x4343, "example.net", QueryType::A), bound)
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = dns::decode_response(&buf[..len]).unwrap();
    assert_eq!(response.id, 0x4343);
    assert_eq!(response.rcode, rcode::NOERROR);
    assert_eq!(
        response.answers,
        vec![AnswerData::Ipv4("203.0.113.44".parse().unwrap())]
    );
    assert_eq!(resolver.hit_count(), 1);
}

#[tokio::test]
async fn tcp_listener_speaks_length_prefixed_messages() {
    let engine = spawn_full_stack(None).await;
    let bound = listen::serve_tcp(engine.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut stream = TcpStream::connect(bound).await.unwrap();
    let message = query_wire(0x4444, "ads.example.com", QueryType::A);
    stream
        .write_all(&(message.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&message).await.unwrap();

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut len_buf))
        .await
        .unwrap()
        .unwrap();
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();

    let response = dns::decode_response(&buf).unwrap();
    assert_eq!(response.id, 0x4444);
    assert_eq!(
        response.answers,
        vec![AnswerData::Ipv4("127.0.0.1".parse().unwrap())]
    );
}
