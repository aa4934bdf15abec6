//! Build-system upload hook.
//!
//! PlatformIO calls this in place of its normal upload step:
//!
//! ```ini
//! [env:light]
//! upload_protocol = custom
//! upload_command  = ota-publish $SOURCE --env $PIOENV
//! ```
//!
//! Progress lines go to `out` (the build log); failures are returned to the
//! caller, which turns them into a non-zero exit.

use std::io::Write;
use std::path::PathBuf;

use chrono::NaiveDate;
use reqwest::Client;

use crate::config::OtaSettings;
use crate::error::Result;
use crate::upload::{self, UploadRequest};

/// What the build system hands over: the built image and the environment
/// that produced it.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub firmware: PathBuf,
    pub env:      String,
}

/// Upload the firmware named by `ctx` and report progress to `out`.
pub async fn publish_firmware<W: Write>(
    http:     &Client,
    ctx:      &BuildContext,
    settings: &OtaSettings,
    today:    NaiveDate,
    out:      &mut W,
) -> Result<()> {
    let req = UploadRequest::new(&ctx.firmware, settings.device.as_deref(), today)?;
    let url = req.url(&settings.base_url);

    say(out, format_args!(
        "Uploading {} to OTA store. Version: {}",
        req.firmware_name,
        req.version_label()
    ))?;
    say(out, format_args!("URL: {url}"))?;
    if let Some(device) = &req.device {
        say(out, format_args!("OTA: command will be sent to {device}/ota"))?;
    }

    upload::upload(http, &settings.base_url, &req).await?;

    say(out, format_args!("The firmware has been successfully uploaded"))
}

fn say<W: Write>(out: &mut W, line: std::fmt::Arguments<'_>) -> Result<()> {
    writeln!(out, "{line}")?;
    Ok(())
}
