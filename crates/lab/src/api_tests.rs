// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use futures_util::StreamExt;

use crate::api::FieldMask;
use crate::error::{error_code, ErrorCode};
use crate::logrec::LogRecord;
use crate::session::manager::SessionFilter;
use crate::session::SessionStatus;
use crate::test_support::{noop_session, TestLabBuilder};

#[tokio::test]
async fn create_then_get_round_trip() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new().start().await?;
    let detail = lab.api.create_session(noop_session("api-session", 0))?;
    assert_eq!(detail.status, SessionStatus::Submitted);

    // A mask is accepted; the full detail may come back.
    let mask = FieldMask { paths: vec!["id".to_owned()] };
    let fetched = lab.api.get_session(&detail.id, Some(&mask))?;
    assert_eq!(fetched.id, detail.id);
    assert_eq!(fetched.name, "api-session");
    Ok(())
}

#[tokio::test]
async fn get_unknown_is_not_found() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new().start().await?;
    let Err(err) = lab.api.get_session(&"nope".to_owned(), None) else {
        anyhow::bail!("expected failure");
    };
    assert_eq!(error_code(&err), Some(ErrorCode::SessionNotFound));
    Ok(())
}

#[tokio::test]
async fn list_accepts_filter() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new().start().await?;
    lab.api.create_session(noop_session("keep-me", 0))?;
    lab.api.create_session(noop_session("drop-me", 0))?;

    let filter = SessionFilter { status_regex: None, name_regex: Some("^keep".to_owned()) };
    let listed = lab.api.list_sessions(None, Some(&filter));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "keep-me");
    Ok(())
}

#[tokio::test]
async fn log_records_stream_to_subscribers() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new().start().await?;
    let mut stream = lab.api.subscribe_log_records();

    lab.api.add_log_record(LogRecord::info("api", "hello stream"));

    let record = stream
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("stream ended"))??;
    assert_eq!(record.message, "hello stream");
    Ok(())
}

#[tokio::test]
async fn unsupported_endpoints_fail_unimplemented() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new().start().await?;
    for result in [
        lab.api.open_job(&"s".to_owned()),
        lab.api.kill_job("j"),
        lab.api.upsert_device_temp_required_dimensions("d"),
    ] {
        let Err(err) = result else {
            anyhow::bail!("expected unimplemented failure");
        };
        assert_eq!(error_code(&err), Some(ErrorCode::Unimplemented));
    }
    Ok(())
}
