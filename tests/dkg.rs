//! Distributed key generation across in-memory nodes

mod common;

use common::{all_active, cluster, eventually, stored_key};
use k256::{ProjectivePoint, Scalar};
use mpc_node::crypto::lagrange::interpolate_scalar;
use mpc_node::mpc::PeerHandler;
use mpc_node::{DkgStartRequest, MpcInit, NodeError, RoundRequest};

#[tokio::test]
async fn test_seeded_dkg_reconstructs_the_seed() {
    let cluster = cluster(2, &[1, 2, 3, 4]);
    let starter = cluster.node(1).unwrap();

    let response = starter
        .run_dkg(DkgStartRequest {
            id: Some("seeded".into()),
            t: Some(2),
            seed: Some(format!("{:0>64}", "1")),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut shares = Vec::new();
    for (&id, node) in &cluster.nodes {
        let key = stored_key(node, "seeded").await;
        assert_eq!(key.public_key, ProjectivePoint::GENERATOR);
        assert_eq!(key.index, id);
        shares.push((id, key.share));
    }
    assert_eq!(response.public_key, stored_key(starter, "seeded").await.public_key_hex());

    // any two shares give back the seed
    assert_eq!(interpolate_scalar(&[shares[0], shares[2]]).unwrap(), Scalar::ONE);
    assert_eq!(interpolate_scalar(&[shares[1], shares[3]]).unwrap(), Scalar::ONE);
}

#[tokio::test]
async fn test_any_threshold_subset_reconstructs() {
    let cluster = cluster(3, &[1, 2, 3, 4, 5]);
    let response = cluster
        .node(2)
        .unwrap()
        .run_dkg(DkgStartRequest {
            id: Some("random".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.t, 3);
    assert_eq!(response.partners, vec![1, 2, 3, 4, 5]);

    let mut shares = Vec::new();
    for (&id, node) in &cluster.nodes {
        shares.push((id, stored_key(node, "random").await));
    }
    let public_key = shares[0].1.public_key;
    assert!(shares.iter().all(|(_, key)| key.public_key == public_key));
    assert!(shares.iter().all(|(_, key)| key.address == response.address));

    for subset in [[0, 1, 2], [0, 3, 4], [1, 2, 4], [2, 3, 4]] {
        let points: Vec<_> = subset.iter().map(|&i| (shares[i].0, shares[i].1.share)).collect();
        let secret = interpolate_scalar(&points).unwrap();
        assert_eq!(ProjectivePoint::GENERATOR * secret, public_key);
    }
}

#[tokio::test]
async fn test_activated_key_reaches_every_node() {
    let cluster = cluster(2, &[1, 2, 3]);
    let response = cluster
        .node(3)
        .unwrap()
        .run_dkg(DkgStartRequest {
            activate: true,
            ..Default::default()
        })
        .await
        .unwrap();

    all_active(&cluster).await;
    for node in cluster.nodes.values() {
        let info = node.info();
        assert_eq!(info.public_key.as_deref(), Some(response.public_key.as_str()));
        assert!(node.health().key_loaded);
    }
}

#[tokio::test]
async fn test_offline_partner_is_left_out() {
    let cluster = cluster(2, &[1, 2, 3]);
    cluster.hub.set_online(3, false);

    let response = cluster
        .node(1)
        .unwrap()
        .run_dkg(DkgStartRequest {
            id: Some("partial".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.partners, vec![1, 2]);

    let key = stored_key(cluster.node(2).unwrap(), "partial").await;
    assert_eq!(key.public_key_hex(), response.public_key);
}

#[tokio::test]
async fn test_too_few_partners_online() {
    let cluster = cluster(3, &[1, 2, 3]);
    cluster.hub.set_online(3, false);

    let err = cluster
        .node(1)
        .unwrap()
        .run_dkg(DkgStartRequest::default())
        .await
        .unwrap_err();
    match err {
        NodeError::InsufficientPartners { threshold, qualified, graph } => {
            assert_eq!(threshold, 3);
            assert_eq!(qualified, 2);
            assert_eq!(graph.unreachable, vec![3]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_lazy_start_refuses_foreign_starter() {
    let cluster = cluster(2, &[1, 2, 3]);
    let node = cluster.node(2).unwrap();

    let init = MpcInit {
        kind: "dkg".into(),
        id: "foreign".into(),
        starter: 9,
        partners: vec![2, 3, 9],
        t: 2,
        params: serde_json::json!({}),
    };
    let err = node
        .handle_round_request(RoundRequest {
            mpc_id: "foreign".into(),
            round: 0,
            from: 9,
            init: Some(init),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::NotQualified(_)));
    assert!(node.registry().get("foreign").await.is_none());
}

#[tokio::test]
async fn test_lazy_start_serves_first_round() {
    let cluster = cluster(2, &[1, 2]);
    let node = cluster.node(2).unwrap();

    let init = MpcInit {
        kind: "dkg".into(),
        id: "lazy".into(),
        starter: 1,
        partners: vec![1, 2],
        t: 2,
        params: serde_json::json!({}),
    };
    let response = node
        .handle_round_request(RoundRequest {
            mpc_id: "lazy".into(),
            round: 0,
            from: 1,
            init: Some(init),
        })
        .await
        .unwrap();
    assert!(response.broadcast.get("Fx").is_some());
    eventually("lazy run registered", move || async move {
        node.registry().get("lazy").await
    })
    .await;
}
