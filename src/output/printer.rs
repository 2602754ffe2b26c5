use super::{Delivery, OutputSink};
use crate::agenda::AgendaDocument;
use crate::PrinterConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Blank lines fed after the agenda so the receipt clears the tear bar.
const PAPER_FEED: &str = "\n\n\n";

/// Failure to set the serial line speed.
#[derive(Debug, thiserror::Error)]
pub enum LineSetupError {
    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Status {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// How the thermal printer sink delivers.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PrinterMode {
    /// Device on Linux, emulated everywhere else.
    #[default]
    Auto,
    /// Echo the receipt to the log.
    Emulated,
    /// Write to the serial device.
    Device,
}

impl PrinterMode {
    /// Resolves `Auto` against the host platform.
    pub fn resolve(self) -> PrinterMode {
        match self {
            PrinterMode::Auto if cfg!(target_os = "linux") => PrinterMode::Device,
            PrinterMode::Auto => PrinterMode::Emulated,
            mode => mode,
        }
    }
}

/// Strips control characters except newlines.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| *c == '\n' || !c.is_control())
        .collect()
}

/// The text sent to the printer for `document`.
pub fn format_receipt(document: &AgendaDocument) -> String {
    let mut receipt = sanitize(&document.header());
    receipt.push('\n');
    for line in document.body() {
        receipt.push_str(&sanitize(&line));
        receipt.push('\n');
    }
    receipt.push_str(PAPER_FEED);
    receipt
}

/// Prints the agenda on a serial thermal receipt printer.
#[derive(Debug, Clone)]
pub struct ThermalPrinterSink {
    mode: PrinterMode,
    device_path: PathBuf,
    baud_rate: u32,
    stty_program: PathBuf,
}

impl ThermalPrinterSink {
    pub fn from_config(config: &PrinterConfig) -> ThermalPrinterSink {
        let mode = config.mode.resolve();

        log::info!(
            "thermal printer in {:?} mode (device {})",
            mode,
            config.device_path.display()
        );

        ThermalPrinterSink {
            mode,
            device_path: config.device_path.clone(),
            baud_rate: config.baud_rate,
            stty_program: config.stty_program.clone(),
        }
    }

    /// Sets the line speed with `stty -F <device> <baud>`.
    async fn configure_line(&self) -> Result<(), LineSetupError> {
        let output = Command::new(&self.stty_program)
            .arg("-F")
            .arg(&self.device_path)
            .arg(self.baud_rate.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| LineSetupError::Spawn {
                program: self.stty_program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(LineSetupError::Status {
                program: self.stty_program.display().to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(())
    }

    async fn write_payload(&self, payload: &[u8]) -> std::io::Result<()> {
        // The device must already exist, never create a regular file in its place.
        let mut device = OpenOptions::new()
            .write(true)
            .open(&self.device_path)
            .await?;
        device.write_all(payload).await?;
        device.flush().await
    }

    fn simulate(receipt: &str) {
        for line in receipt.trim_end().lines() {
            log::info!("[printer simulation] {line}");
        }
    }
}

#[async_trait]
impl OutputSink for ThermalPrinterSink {
    fn name(&self) -> &'static str {
        "thermal-printer"
    }

    async fn deliver(&self, document: &AgendaDocument) -> Delivery {
        let receipt = format_receipt(document);

        if self.mode != PrinterMode::Device {
            ThermalPrinterSink::simulate(&receipt);
            return Delivery::Simulated;
        }

        if let Err(err) = self.configure_line().await {
            log::error!(
                "failed to set {} to {} baud: {err}",
                self.device_path.display(),
                self.baud_rate
            );
            return Delivery::Failed(err.into());
        }

        if let Err(err) = self.write_payload(receipt.as_bytes()).await {
            log::error!(
                "failed to write agenda to {}: {err}",
                self.device_path.display()
            );
            return Delivery::Failed(err.into());
        }

        log::info!("printed agenda on {}", self.device_path.display());
        Delivery::Delivered
    }
}
