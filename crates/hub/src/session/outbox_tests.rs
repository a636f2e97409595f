// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

#[tokio::test]
async fn push_then_recv_preserves_order() {
    let ob: Arc<Outbox<u32>> = Outbox::new(4);
    ob.push(1);
    ob.push(2);
    ob.push(3);
    let batch = ob.recv_batch().await.unwrap();
    assert_eq!(batch, vec![1, 2, 3]);
}

#[tokio::test]
async fn overflow_drops_oldest_not_newest() {
    let ob: Arc<Outbox<u32>> = Outbox::new(2);
    ob.push(1);
    ob.push(2);
    ob.push(3); // should drop 1
    let batch = ob.recv_batch().await.unwrap();
    assert_eq!(batch, vec![2, 3]);
    assert_eq!(ob.dropped_count(), 1);
}

#[tokio::test]
async fn close_wakes_pending_recv_with_none() {
    let ob: Arc<Outbox<u32>> = Outbox::new(4);
    let ob2 = Arc::clone(&ob);
    let handle = tokio::spawn(async move { ob2.recv_batch().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    ob.close();
    let result = handle.await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn recv_blocks_until_pushed() {
    let ob: Arc<Outbox<u32>> = Outbox::new(4);
    let ob2 = Arc::clone(&ob);
    let handle = tokio::spawn(async move { ob2.recv_batch().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    ob.push(42);
    let result = handle.await.unwrap();
    assert_eq!(result, Some(vec![42]));
}
