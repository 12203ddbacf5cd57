//! Convergence properties: delivery order must not matter.
//!
//! A six-event fixture (network, link_invite, user, peer, channel, message)
//! is hand-delivered to fresh observer nodes in varying orders; every
//! ordering must settle to identical projection tables, and double delivery
//! must change nothing.

use std::collections::HashMap;
use std::sync::OnceLock;

use proptest::prelude::*;
use serde_json::json;

use quiet_crypto::{derive_symmetric_key, Keypair};
use quiet_engine::Node;
use quiet_protocol::wire::{InviteLink, WireEnvelope, INVITE_TRANSIT_KDF_INFO};
use quiet_protocol::Event;

struct Fixture {
    _dir: tempfile::TempDir,
    /// The six datagrams, in creation order.
    datagrams: Vec<Vec<u8>>,
    link: String,
    /// Snapshot an observer must converge to.
    baseline: String,
}

fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(build_fixture())
    })
}

async fn build_fixture() -> Fixture {
    quiet_observability::init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let alice = Node::open(dir.path().join("alice.db")).await.unwrap();
    let bob = Node::open(dir.path().join("bob.db")).await.unwrap();

    alice
        .submit_command(
            "create_network",
            json!({ "name": "quietnet", "username": "alice" }),
        )
        .await
        .unwrap();
    let net = alice.query("networks", json!({})).await.unwrap()[0]["network_id"]
        .as_str()
        .unwrap()
        .to_string();

    alice
        .submit_command("create_invite", json!({ "network_id": net }))
        .await
        .unwrap();
    let invites = alice.query("invites", json!({})).await.unwrap();
    let invite_pubkey = invites[0]["invite_pubkey"].as_str().unwrap();
    let link = alice
        .query("invite_link", json!({ "invite_pubkey": invite_pubkey }))
        .await
        .unwrap()[0]["invite_link"]
        .as_str()
        .unwrap()
        .to_string();

    // Bob joins and his user event reaches alice.
    bob.submit_command("join_as_user", json!({ "invite_code": link, "name": "bob" }))
        .await
        .unwrap();
    bob.run_sync().await.unwrap();
    shuttle(&bob, &alice).await;
    shuttle(&alice, &bob).await;
    while bob.run_recheck().await.unwrap() > 0 {}
    shuttle(&bob, &alice).await;
    while alice.run_recheck().await.unwrap() > 0 {}

    // An out-of-band peer record, a channel in the default group, a message.
    let extra_peer = Keypair::generate();
    alice
        .submit_command(
            "add_peer",
            json!({
                "network_id": net,
                "pubkey": extra_peer.public(),
                "seal_pubkey": extra_peer.seal_public().unwrap(),
            }),
        )
        .await
        .unwrap();
    let receipt = alice
        .submit_command("create_channel", json!({ "group_id": net, "name": "general" }))
        .await
        .unwrap();
    let channel_id = receipt.event_ids[0].to_hex();
    alice
        .submit_command(
            "create_message",
            json!({ "channel_id": channel_id, "text": "hi" }),
        )
        .await
        .unwrap();

    // Six plain datagrams under the invite's bootstrap transit key.
    let parsed = InviteLink::parse(&link).unwrap();
    let transit = derive_symmetric_key(&parsed.secret, INVITE_TRANSIT_KDF_INFO).unwrap();

    let mut by_type: HashMap<String, Vec<u8>> = HashMap::new();
    for row in alice.query("events", json!({})).await.unwrap() {
        let bytes = hex::decode(row["payload_blob"].as_str().unwrap()).unwrap();
        let event = Event::from_canonical_bytes(&bytes).unwrap();
        let wire = WireEnvelope::Plain { event: bytes };
        by_type.insert(
            event.event_type.clone(),
            quiet_protocol::wire::encode_datagram(&transit, &wire).unwrap(),
        );
    }
    let order = ["network", "link_invite", "user", "peer", "channel", "message"];
    assert_eq!(by_type.len(), order.len(), "fixture drifted: {:?}", by_type.keys());
    let datagrams: Vec<Vec<u8>> = order.iter().map(|t| by_type[*t].clone()).collect();

    // Baseline: creation order, each datagram once.
    let indices: Vec<usize> = (0..datagrams.len()).collect();
    let baseline = observe(&datagrams, &link, &indices, false).await;

    Fixture {
        _dir: dir,
        datagrams,
        link,
        baseline,
    }
}

async fn shuttle(from: &Node, to: &Node) {
    for item in from.drain_outgoing(100).await.unwrap() {
        to.ingest_datagram(item.datagram.clone(), None).await.unwrap();
        from.mark_sent(item.id).await.unwrap();
    }
}

/// Spin up a fresh observer, join through the link, deliver the datagrams in
/// the given index order (optionally each twice), settle, and snapshot.
/// The observer's database lives in its own temp dir, deleted on return.
async fn observe(
    datagrams: &[Vec<u8>],
    link: &str,
    order: &[usize],
    duplicate: bool,
) -> String {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::open(dir.path().join("observer.db")).await.unwrap();
    node.submit_command("join_as_user", json!({ "invite_code": link, "name": "observer" }))
        .await
        .unwrap();

    for &index in order {
        node.ingest_datagram(datagrams[index].clone(), None)
            .await
            .unwrap();
        if duplicate {
            node.ingest_datagram(datagrams[index].clone(), None)
                .await
                .unwrap();
        }
    }
    for _ in 0..6 {
        if node.run_recheck().await.unwrap() == 0 {
            break;
        }
    }

    snapshot(&node).await
}

/// Deterministic projection snapshot, excluding the observer's own rows
/// (its identity is freshly generated per run).
async fn snapshot(node: &Node) -> String {
    let own_pubkey = node.query("identities", json!({})).await.unwrap()[0]["pubkey"]
        .as_str()
        .unwrap()
        .to_string();

    let users: Vec<_> = node
        .query("users", json!({}))
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u["pubkey"].as_str().unwrap() != own_pubkey)
        .collect();
    let peers: Vec<_> = node
        .query("peers", json!({}))
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p["pubkey"].as_str().unwrap() != own_pubkey)
        .collect();
    let groups = node.query("groups", json!({})).await.unwrap();
    let channels = node.query("channels", json!({})).await.unwrap();
    let messages = node.query("messages", json!({})).await.unwrap();

    serde_json::to_string(&json!({
        "users": users,
        "peers": peers,
        "groups": groups,
        "channels": channels,
        "messages": messages,
    }))
    .unwrap()
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn go(prefix: &mut Vec<usize>, rest: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if rest.is_empty() {
            out.push(prefix.clone());
            return;
        }
        for i in 0..rest.len() {
            let item = rest.remove(i);
            prefix.push(item);
            go(prefix, rest, out);
            prefix.pop();
            rest.insert(i, item);
        }
    }
    let mut out = Vec::new();
    go(&mut Vec::new(), &mut (0..n).collect(), &mut out);
    out
}

#[test]
fn all_720_orderings_converge() {
    let fx = fixture();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    for order in permutations(fx.datagrams.len()) {
        let snapshot = rt.block_on(observe(&fx.datagrams, &fx.link, &order, false));
        assert_eq!(
            snapshot, fx.baseline,
            "ordering {order:?} diverged from baseline"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 12, ..ProptestConfig::default() })]

    /// Any shuffled double delivery settles to the same tables as the
    /// baseline single delivery.
    #[test]
    fn shuffled_double_delivery_converges(order in Just(vec![0usize, 1, 2, 3, 4, 5]).prop_shuffle()) {
        let fx = fixture();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let snapshot = rt.block_on(observe(&fx.datagrams, &fx.link, &order, true));
        prop_assert_eq!(snapshot, fx.baseline.clone());
    }
}
