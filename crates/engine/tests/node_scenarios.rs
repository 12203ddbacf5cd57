//! Black-box scenarios over real on-disk nodes.
//!
//! Each test speaks only the node API: `submit_command`, `ingest_datagram`,
//! `query`, `drain_outgoing`, `run_sync`, `run_recheck`. Datagrams travel
//! between nodes the way a transport would carry them.

use serde_json::json;

use quiet_engine::Node;

async fn open_node(dir: &tempfile::TempDir, name: &str) -> Node {
    quiet_observability::init_for_tests();
    Node::open(dir.path().join(format!("{name}.db")))
        .await
        .expect("failed to open node")
}

async fn one_network_id(node: &Node) -> String {
    let rows = node.query("networks", json!({})).await.unwrap();
    assert_eq!(rows.len(), 1, "expected exactly one network");
    rows[0]["network_id"].as_str().unwrap().to_string()
}

/// Create an invite on `node` and return the shareable link.
async fn invite_link_for(node: &Node, network_hex: &str) -> String {
    let receipt = node
        .submit_command("create_invite", json!({ "network_id": network_hex }))
        .await
        .unwrap();
    assert!(receipt.success, "create_invite failed: {:?}", receipt.error);

    let invites = node
        .query("invites", json!({ "network_id": network_hex }))
        .await
        .unwrap();
    let invite_pubkey = invites[0]["invite_pubkey"].as_str().unwrap();
    let link = node
        .query("invite_link", json!({ "invite_pubkey": invite_pubkey }))
        .await
        .unwrap();
    link[0]["invite_link"].as_str().unwrap().to_string()
}

/// Move every due outgoing datagram from one node to the other.
async fn deliver(from: &Node, to: &Node) -> usize {
    let batch = from.drain_outgoing(100).await.unwrap();
    let mut delivered = 0;
    for item in batch {
        to.ingest_datagram(item.datagram.clone(), None).await.unwrap();
        from.mark_sent(item.id).await.unwrap();
        delivered += 1;
    }
    delivered
}

/// Run recheck cycles until a pass re-drives nothing.
async fn settle(node: &Node) {
    for _ in 0..5 {
        if node.run_recheck().await.unwrap() == 0 {
            break;
        }
    }
}

/// One sync round-trip: requester asks, responder answers, requester
/// re-drives whatever the new events unblocked.
async fn sync_round(requester: &Node, responder: &Node) {
    requester.run_sync().await.unwrap();
    deliver(requester, responder).await;
    deliver(responder, requester).await;
    settle(requester).await;
}

/// Full two-node setup: alice founds a network, bob joins through an invite
/// link, both converge. Returns (alice, bob, network_id_hex).
async fn joined_pair(dir: &tempfile::TempDir) -> (Node, Node, String) {
    let alice = open_node(dir, "alice").await;
    let bob = open_node(dir, "bob").await;

    let receipt = alice
        .submit_command(
            "create_network",
            json!({ "name": "quietnet", "username": "alice" }),
        )
        .await
        .unwrap();
    assert!(receipt.success);

    let net = one_network_id(&alice).await;
    let link = invite_link_for(&alice, &net).await;

    let receipt = bob
        .submit_command("join_as_user", json!({ "invite_code": link, "name": "bob" }))
        .await
        .unwrap();
    assert!(receipt.success);
    // The join parks until the network event arrives over sync.
    assert_eq!(receipt.blocked, 1);

    sync_round(&bob, &alice).await;
    deliver(&bob, &alice).await;
    settle(&alice).await;

    (alice, bob, net)
}

#[tokio::test]
async fn create_network_channel_message() {
    let dir = tempfile::tempdir().unwrap();
    let node = open_node(&dir, "solo").await;

    let receipt = node
        .submit_command("create_network", json!({ "name": "net", "username": "op" }))
        .await
        .unwrap();
    assert!(receipt.success);
    // identity + network signed; identity is local-only.
    assert_eq!(receipt.event_ids.len(), 2);

    let net = one_network_id(&node).await;

    // The default group shares the network's id.
    let groups = node.query("groups", json!({})).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["group_id"].as_str().unwrap(), net);

    let receipt = node
        .submit_command(
            "create_channel",
            json!({ "group_id": net, "name": "general" }),
        )
        .await
        .unwrap();
    assert!(receipt.success);
    let channel_id = receipt.event_ids[0].to_hex();

    let receipt = node
        .submit_command(
            "create_message",
            json!({ "channel_id": channel_id, "text": "hi" }),
        )
        .await
        .unwrap();
    assert!(receipt.success);

    // Exactly three wire events: network, channel, message.
    let events = node.query("events", json!({})).await.unwrap();
    assert_eq!(events.len(), 3);

    assert_eq!(node.query("networks", json!({})).await.unwrap().len(), 1);
    assert_eq!(node.query("channels", json!({})).await.unwrap().len(), 1);
    let messages = node.query("messages", json!({})).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"].as_str().unwrap(), "hi");
}

#[tokio::test]
async fn invite_join_converges_across_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob, net) = joined_pair(&dir).await;

    let alice_users = alice.query("users", json!({ "network_id": net })).await.unwrap();
    let bob_users = bob.query("users", json!({ "network_id": net })).await.unwrap();

    assert_eq!(alice_users.len(), 2);
    assert_eq!(alice_users, bob_users);

    let names: Vec<&str> = alice_users
        .iter()
        .map(|u| u["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"alice") && names.contains(&"bob"));
}

#[tokio::test]
async fn encrypted_message_defers_until_its_key_arrives() {
    let dir = tempfile::tempdir().unwrap();
    let alice = open_node(&dir, "alice").await;
    let bob = open_node(&dir, "bob").await;

    alice
        .submit_command(
            "create_network",
            json!({ "name": "quietnet", "username": "alice" }),
        )
        .await
        .unwrap();
    let net = one_network_id(&alice).await;

    // A keyed group with a channel, before bob exists.
    let receipt = alice
        .submit_command("create_group", json!({ "network_id": net, "name": "ops" }))
        .await
        .unwrap();
    assert!(receipt.success);
    let group_id = receipt.event_ids[0].to_hex();

    let receipt = alice
        .submit_command(
            "create_channel",
            json!({ "group_id": group_id, "name": "war-room" }),
        )
        .await
        .unwrap();
    let channel_id = receipt.event_ids[0].to_hex();

    let link = invite_link_for(&alice, &net).await;
    bob.submit_command("join_as_user", json!({ "invite_code": link, "name": "bob" }))
        .await
        .unwrap();
    sync_round(&bob, &alice).await;
    deliver(&bob, &alice).await;
    settle(&alice).await;

    // Bob knows the key's metadata but not its secret.
    let receipt = alice
        .submit_command(
            "create_message",
            json!({ "channel_id": channel_id, "text": "secret plans" }),
        )
        .await
        .unwrap();
    assert!(receipt.success);
    deliver(&alice, &bob).await;

    let blocked = bob.query("blocked", json!({})).await.unwrap();
    assert!(
        blocked
            .iter()
            .any(|b| b["reason_type"].as_str().unwrap() == "missing_key"),
        "expected a missing_key entry, got {blocked:?}"
    );
    assert_eq!(bob.query("messages", json!({})).await.unwrap().len(), 0);

    // Granting membership seals the group key to bob.
    let users = alice.query("users", json!({ "network_id": net })).await.unwrap();
    let bob_user = users
        .iter()
        .find(|u| u["name"].as_str().unwrap() == "bob")
        .unwrap();
    let receipt = alice
        .submit_command(
            "add_group_member",
            json!({ "group_id": group_id, "user_id": bob_user["user_id"] }),
        )
        .await
        .unwrap();
    assert!(receipt.success);

    deliver(&alice, &bob).await;
    settle(&bob).await;

    let messages = bob.query("messages", json!({})).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"].as_str().unwrap(), "secret plans");
}

#[tokio::test]
async fn out_of_order_dependency_parks_then_projects() {
    let dir = tempfile::tempdir().unwrap();
    let alice = open_node(&dir, "alice").await;
    let carol = open_node(&dir, "carol").await;

    alice
        .submit_command(
            "create_network",
            json!({ "name": "quietnet", "username": "alice" }),
        )
        .await
        .unwrap();
    let net = one_network_id(&alice).await;

    let receipt = alice
        .submit_command("create_group", json!({ "network_id": net, "name": "ops" }))
        .await
        .unwrap();
    let group_id = receipt.event_ids[0].to_hex();
    let receipt = alice
        .submit_command(
            "create_channel",
            json!({ "group_id": group_id, "name": "war-room" }),
        )
        .await
        .unwrap();
    assert!(receipt.success);

    let link = invite_link_for(&alice, &net).await;
    carol
        .submit_command("join_as_user", json!({ "invite_code": link, "name": "carol" }))
        .await
        .unwrap();

    // Hand-deliver alice's events out of order: network, then channel
    // (whose group does not exist yet at carol), then the group.
    let datagrams = wire_fixtures::plain_datagrams(&alice, &link).await;
    carol
        .ingest_datagram(datagrams["network"].clone(), None)
        .await
        .unwrap();
    carol
        .ingest_datagram(datagrams["channel"].clone(), None)
        .await
        .unwrap();

    let blocked = carol.query("blocked", json!({})).await.unwrap();
    assert!(
        blocked.iter().any(|b| {
            b["reason_type"].as_str().unwrap() == "missing_dep"
                && b["reason_key"].as_str().unwrap() == group_id
        }),
        "expected channel parked on its group, got {blocked:?}"
    );
    assert_eq!(carol.query("channels", json!({})).await.unwrap().len(), 0);

    carol
        .ingest_datagram(datagrams["group"].clone(), None)
        .await
        .unwrap();
    settle(&carol).await;

    let channels = carol.query("channels", json!({})).await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0]["name"].as_str().unwrap(), "war-room");
}

#[tokio::test(flavor = "multi_thread")]
async fn re_ingesting_a_datagram_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let alice = open_node(&dir, "alice").await;
    let carol = open_node(&dir, "carol").await;

    alice
        .submit_command(
            "create_network",
            json!({ "name": "quietnet", "username": "alice" }),
        )
        .await
        .unwrap();
    let net = one_network_id(&alice).await;
    let receipt = alice
        .submit_command("create_channel", json!({ "group_id": net, "name": "general" }))
        .await
        .unwrap();
    let channel_id = receipt.event_ids[0].to_hex();
    alice
        .submit_command(
            "create_message",
            json!({ "channel_id": channel_id, "text": "once only" }),
        )
        .await
        .unwrap();

    let link = invite_link_for(&alice, &net).await;
    carol
        .submit_command("join_as_user", json!({ "invite_code": link, "name": "carol" }))
        .await
        .unwrap();

    let datagrams = wire_fixtures::plain_datagrams(&alice, &link).await;
    carol
        .ingest_datagram(datagrams["network"].clone(), None)
        .await
        .unwrap();
    carol
        .ingest_datagram(datagrams["channel"].clone(), None)
        .await
        .unwrap();

    // The same message datagram, ten times, concurrently.
    let message = datagrams["message"].clone();
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let node = carol.clone();
        let bytes = message.clone();
        tasks.push(tokio::spawn(async move {
            node.ingest_datagram(bytes, None).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let events = carol.query("events", json!({})).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e["event_type"].as_str().unwrap() == "message")
            .count(),
        1
    );
    let messages = carol.query("messages", json!({})).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"].as_str().unwrap(), "once only");
}

#[tokio::test]
async fn removed_peer_content_disappears_retroactively() {
    let dir = tempfile::tempdir().unwrap();
    let (alice, bob, net) = joined_pair(&dir).await;

    // Bob posts into the default group's channel.
    let receipt = alice
        .submit_command("create_channel", json!({ "group_id": net, "name": "general" }))
        .await
        .unwrap();
    let channel_id = receipt.event_ids[0].to_hex();
    deliver(&alice, &bob).await;

    let receipt = bob
        .submit_command(
            "create_message",
            json!({ "channel_id": channel_id, "text": "hello from bob" }),
        )
        .await
        .unwrap();
    assert!(receipt.success);
    deliver(&bob, &alice).await;
    assert_eq!(alice.query("messages", json!({})).await.unwrap().len(), 1);

    let users = alice.query("users", json!({ "network_id": net })).await.unwrap();
    let bob_user = users
        .iter()
        .find(|u| u["name"].as_str().unwrap() == "bob")
        .unwrap();

    let receipt = alice
        .submit_command(
            "remove_peer",
            json!({ "network_id": net, "pubkey": bob_user["pubkey"] }),
        )
        .await
        .unwrap();
    assert!(receipt.success);

    // Tombstone plus retroactive re-projection in one transaction.
    assert_eq!(alice.query("messages", json!({})).await.unwrap().len(), 0);
    let remaining = alice.query("users", json!({ "network_id": net })).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["name"].as_str().unwrap(), "alice");
}

#[tokio::test]
async fn blobs_slice_and_reassemble() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let dir = tempfile::tempdir().unwrap();
    let node = open_node(&dir, "solo").await;

    node.submit_command("create_network", json!({ "name": "net", "username": "op" }))
        .await
        .unwrap();
    let net = one_network_id(&node).await;
    let receipt = node
        .submit_command("create_channel", json!({ "group_id": net, "name": "files" }))
        .await
        .unwrap();
    let channel_id = receipt.event_ids[0].to_hex();

    // 1300 bytes -> three slices under the 512-byte ceiling.
    let content: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
    let receipt = node
        .submit_command(
            "create_blob",
            json!({
                "channel_id": channel_id,
                "name": "notes.bin",
                "data": STANDARD.encode(&content),
            }),
        )
        .await
        .unwrap();
    assert!(receipt.success);
    // One descriptor plus three slices.
    assert_eq!(receipt.event_ids.len(), 4);

    let blobs = node.query("blobs", json!({})).await.unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0]["size"].as_i64().unwrap(), 1300);
    assert_eq!(blobs[0]["slice_count"].as_i64().unwrap(), 3);

    let slices = node
        .query("blob_slices", json!({ "blob_id": blobs[0]["blob_id"] }))
        .await
        .unwrap();
    assert_eq!(slices.len(), 3);
    let mut reassembled = Vec::new();
    for slice in &slices {
        reassembled.extend(hex::decode(slice["data"].as_str().unwrap()).unwrap());
    }
    assert_eq!(reassembled, content);
}

#[tokio::test]
async fn stale_address_update_loses() {
    use std::sync::Arc;

    use quiet_core::FixedClock;
    use quiet_store::StoreConfig;

    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at(1_000_000));
    let alice = quiet_engine::Node::open_with(
        StoreConfig::new(dir.path().join("alice.db")),
        clock.clone(),
    )
    .await
    .unwrap();
    let carol = open_node(&dir, "carol").await;

    alice
        .submit_command(
            "create_network",
            json!({ "name": "quietnet", "username": "alice" }),
        )
        .await
        .unwrap();
    let net = one_network_id(&alice).await;
    let link = invite_link_for(&alice, &net).await;

    alice
        .submit_command(
            "set_address",
            json!({ "network_id": net, "ip": "10.0.0.1", "port": 7000 }),
        )
        .await
        .unwrap();
    clock.advance(60_000);
    alice
        .submit_command(
            "set_address",
            json!({ "network_id": net, "ip": "10.0.0.2", "port": 7001 }),
        )
        .await
        .unwrap();

    // Two address events; deliver the newer one first, then the stale one.
    let events = alice.query("events", json!({})).await.unwrap();
    let addresses: Vec<Vec<u8>> = events
        .iter()
        .filter(|e| e["event_type"].as_str().unwrap() == "address")
        .map(|e| hex::decode(e["payload_blob"].as_str().unwrap()).unwrap())
        .collect();
    assert_eq!(addresses.len(), 2);

    carol
        .submit_command("join_as_user", json!({ "invite_code": link, "name": "carol" }))
        .await
        .unwrap();

    let parsed = quiet_protocol::wire::InviteLink::parse(&link).unwrap();
    let transit = quiet_crypto::derive_symmetric_key(
        &parsed.secret,
        quiet_protocol::wire::INVITE_TRANSIT_KDF_INFO,
    )
    .unwrap();
    let datagrams = wire_fixtures::plain_datagrams(&alice, &link).await;
    carol
        .ingest_datagram(datagrams["network"].clone(), None)
        .await
        .unwrap();
    for payload in [&addresses[1], &addresses[0]] {
        let wire = quiet_protocol::wire::WireEnvelope::Plain {
            event: payload.clone(),
        };
        let datagram = quiet_protocol::wire::encode_datagram(&transit, &wire).unwrap();
        carol.ingest_datagram(datagram, None).await.unwrap();
    }

    let rows = carol.query("addresses", json!({})).await.unwrap();
    assert_eq!(rows.len(), 1);
    // The larger (timestamp, event_id) pair wins regardless of arrival order.
    assert_eq!(rows[0]["ip"].as_str().unwrap(), "10.0.0.2");
    assert_eq!(rows[0]["port"].as_i64().unwrap(), 7001);
}

/// Shared helpers for hand-delivering plain events under an invite's
/// bootstrap transit key.
mod wire_fixtures {
    use std::collections::HashMap;

    use serde_json::json;

    use quiet_crypto::derive_symmetric_key;
    use quiet_engine::Node;
    use quiet_protocol::wire::{InviteLink, WireEnvelope, INVITE_TRANSIT_KDF_INFO};
    use quiet_protocol::Event;

    /// One plain datagram per stored event on `node`, keyed by event type
    /// (last one wins for repeated types), encrypted under the invite link's
    /// bootstrap transit key.
    pub async fn plain_datagrams(node: &Node, link: &str) -> HashMap<String, Vec<u8>> {
        let link = InviteLink::parse(link).unwrap();
        let transit = derive_symmetric_key(&link.secret, INVITE_TRANSIT_KDF_INFO).unwrap();

        let mut out = HashMap::new();
        for row in node.query("events", json!({})).await.unwrap() {
            let bytes = hex::decode(row["payload_blob"].as_str().unwrap()).unwrap();
            let event = Event::from_canonical_bytes(&bytes).unwrap();
            let wire = WireEnvelope::Plain { event: bytes };
            let datagram = quiet_protocol::wire::encode_datagram(&transit, &wire).unwrap();
            out.insert(event.event_type.clone(), datagram);
        }
        out
    }
}
