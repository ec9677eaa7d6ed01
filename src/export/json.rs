use anyhow::Result;
use serde::Serialize;
use std::io::Write;

use crate::state::{Session, Summary};

#[derive(Serialize)]
struct SessionExport<'a> {
    #[serde(flatten)]
    session: &'a Session,
    summary: Summary,
}

/// Export session to JSON, with the derived summary alongside the outcomes
pub fn export_json<W: Write>(session: &Session, mut writer: W) -> Result<()> {
    let export = SessionExport {
        session,
        summary: session.summary(),
    };
    serde_json::to_writer_pretty(&mut writer, &export)?;
    writeln!(writer)?;
    Ok(())
}
