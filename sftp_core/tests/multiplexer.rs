use std::time::Duration;

use sftp_core::core::SessionStatus;
use sftp_core::protocol::{Request, Response, StatusCode};
use sftp_core::SftpError;

mod common;
use common::fake_transport::Hold;
use common::Harness;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn responses_released_in_reverse_reach_their_own_callers() -> anyhow::Result<()> {
    let h = Harness::new();
    for size in 1..=8usize {
        h.remote.put_file(&format!("/f{size}"), vec![0u8; size]);
    }
    let session = h.registry.open(&common::profile("mux")).await?;
    h.remote.faults().hold = Hold::All;

    let mut pending = Vec::new();
    for size in 1..=8u64 {
        let request = Request::Stat {
            path: format!("/f{size}"),
        };
        pending.push((size, session.send(&request)?));
    }
    h.remote.until("eight held responses", |r| r.held() == 8).await;
    assert_eq!(session.pending_count(), 8);
    assert_eq!(session.status(), SessionStatus::Busy);

    h.remote.release_held(true);
    for (size, response) in pending {
        let attrs = response.wait(WAIT).await?.into_attrs()?;
        assert_eq!(attrs.size, Some(size), "reply for /f{size} went elsewhere");
    }
    assert_eq!(session.pending_count(), 0);
    h.remote
        .until("session idle", |_| session.status() == SessionStatus::Idle)
        .await;
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_get_distinct_request_ids() -> anyhow::Result<()> {
    let h = Harness::new();
    let session = h.registry.open(&common::profile("ids")).await?;

    let mut ids = Vec::new();
    let mut pending = Vec::new();
    for _ in 0..16 {
        let p = session.send(&Request::Realpath { path: ".".into() })?;
        ids.push(p.id());
        pending.push(p);
    }
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len());

    for p in pending {
        p.wait(WAIT).await?;
    }
    Ok(())
}

#[tokio::test]
async fn unsolicited_response_is_dropped_and_session_survives() -> anyhow::Result<()> {
    let h = Harness::new();
    let session = h.registry.open(&common::profile("stray")).await?;

    h.remote
        .inject(1, 9_999, &Response::status(StatusCode::Ok, "nobody asked"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session.is_open());
    assert_eq!(session.realpath("docs").await?, "/home/test/docs");
    Ok(())
}

#[tokio::test]
async fn timed_out_request_frees_its_slot_and_late_reply_is_ignored() -> anyhow::Result<()> {
    let h = Harness::new();
    let session = h.registry.open(&common::profile("late")).await?;
    h.remote.faults().hold = Hold::All;

    let pending = session.send(&Request::Realpath { path: ".".into() })?;
    let err = pending.wait(Duration::from_millis(50)).await.err();
    assert!(matches!(err, Some(SftpError::RequestTimeout { .. })), "{err:?}");
    assert_eq!(session.pending_count(), 0);

    // The answer arrives after the caller gave up.
    h.remote.release_held(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.is_open(), "a request timeout is not a session failure");
    assert_eq!(session.realpath(".").await?, "/home/test");
    Ok(())
}

#[tokio::test]
async fn dropping_a_pending_request_releases_its_slot() -> anyhow::Result<()> {
    let h = Harness::new();
    let session = h.registry.open(&common::profile("drop")).await?;
    h.remote.faults().hold = Hold::All;

    let pending = session.send(&Request::Realpath { path: ".".into() })?;
    h.remote.until("held", |r| r.held() == 1).await;
    assert_eq!(session.pending_count(), 1);
    drop(pending);
    h.remote
        .until("slot released", |_| session.pending_count() == 0)
        .await;
    Ok(())
}

#[tokio::test]
async fn aborted_request_is_gone_when_abort_returns() -> anyhow::Result<()> {
    let h = Harness::new();
    let session = h.registry.open(&common::profile("abort")).await?;
    h.remote.faults().hold = Hold::All;

    let pending = session.send(&Request::Realpath { path: ".".into() })?;
    h.remote.until("held", |r| r.held() == 1).await;
    pending.abort().await;
    assert_eq!(session.pending_count(), 0);

    h.remote.release_held(false);
    assert_eq!(session.realpath(".").await?, "/home/test");
    Ok(())
}

#[tokio::test]
async fn connection_loss_fails_every_waiter_with_the_same_cause() -> anyhow::Result<()> {
    let h = Harness::new();
    h.remote.put_file("/x", vec![1, 2, 3]);
    let session = h.registry.open(&common::profile("loss")).await?;
    h.remote.faults().hold = Hold::All;

    let a = session.send(&Request::Stat { path: "/x".into() })?;
    let b = session.send(&Request::Stat { path: "/x".into() })?;
    h.remote.until("two held", |r| r.held() == 2).await;

    // Any write now kills the connection.
    h.remote.faults().disconnect_on_write = Some(1);
    h.remote.faults().hold = Hold::Off;
    let c = session.send(&Request::Write {
        handle: bytes::Bytes::from_static(b"h0"),
        offset: 0,
        data: bytes::Bytes::from_static(b"boom"),
    })?;

    for p in [a, b, c] {
        let err = p.wait(WAIT).await.err().expect("request fails with the session");
        assert!(err.is_session_fatal(), "{err:?}");
    }
    h.remote
        .until("session failed", |_| session.status() == SessionStatus::Failed)
        .await;
    assert_eq!(session.pending_count(), 0);
    assert!(session.failure().is_some());
    Ok(())
}
