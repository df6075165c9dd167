// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use bridge_protocol::{
    message::{
        AppCapabilities, CustomProcedureParams, ImportParams, MessageResult, NotificationSendParams,
        ProgressChangeParams, RunFinishedParams, StatusResult,
    },
    validator::ErrorDetail,
};
use schemars::{JsonSchema, schema_for};

use crate::config::BridgeConfig;

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<(), Error> {
    let schema = schema_for!(T);
    let json = serde_json::to_string_pretty(&schema)?;
    fs::write(out_dir.join(format!("{name}.schema.json")), json)?;
    Ok(())
}

/// Write the JSON Schemas of the payload types into `out_dir`. Returns the
/// number of files written.
pub fn write_schema(out_dir: &Path) -> Result<usize, Error> {
    fs::create_dir_all(out_dir)?;

    write_one::<BridgeConfig>(out_dir, "bridge-config")?;
    write_one::<MessageResult>(out_dir, "message-result")?;
    write_one::<AppCapabilities>(out_dir, "app-capabilities")?;
    write_one::<StatusResult>(out_dir, "status")?;
    write_one::<ImportParams>(out_dir, "dataflow-import")?;
    write_one::<CustomProcedureParams>(out_dir, "custom-procedure")?;
    write_one::<ProgressChangeParams>(out_dir, "progress-change")?;
    write_one::<RunFinishedParams>(out_dir, "run-finished")?;
    write_one::<NotificationSendParams>(out_dir, "notification-send")?;
    write_one::<ErrorDetail>(out_dir, "error-detail")?;

    Ok(10)
}
