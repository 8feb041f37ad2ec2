//! Printing through an external spooler command (`lp`, `lpr`, `SumatraPDF`, ...).
use crate::error::IoError;
use std::io::Write;
use std::process::Command;
use weigh_config::PrintSection;
use weigh_traits::{BoxError, Printer};

#[derive(Debug, Clone)]
pub struct CommandPrinter {
    command: String,
    args: Vec<String>,
    printer_args: Vec<String>,
}

impl CommandPrinter {
    pub fn from_section(p: &PrintSection) -> Self {
        Self {
            command: p.command.clone(),
            args: p.args.clone(),
            printer_args: p.printer_args.clone(),
        }
    }

    /// Argument list for one job. `printer_args` come first when a printer is named.
    pub fn render_args(&self, file: &str, printer: Option<&str>) -> Vec<String> {
        let fill = |a: &String| a.replace("{file}", file).replace("{printer}", printer.unwrap_or(""));
        let mut out: Vec<String> = match printer {
            Some(_) => self.printer_args.iter().map(fill).collect(),
            None => Vec::new(),
        };
        out.extend(self.args.iter().map(fill));
        out
    }
}

impl Printer for CommandPrinter {
    fn print(&self, document: &[u8], printer: Option<&str>) -> Result<(), BoxError> {
        let mut spool = tempfile::Builder::new()
            .prefix("weigh-print-")
            .suffix(".pdf")
            .tempfile()
            .map_err(IoError::from)?;
        spool.write_all(document).map_err(IoError::from)?;
        spool.flush().map_err(IoError::from)?;

        let file = spool.path().to_string_lossy().into_owned();
        let args = self.render_args(&file, printer);
        tracing::debug!(command = %self.command, ?args, "spooling print job");
        let out = Command::new(&self.command)
            .args(&args)
            .output()
            .map_err(|e| IoError::PrintCommand(format!("{}: {e}", self.command)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let msg = if stderr.is_empty() {
                format!("{} exited with {}", self.command, out.status)
            } else {
                stderr
            };
            return Err(Box::new(IoError::PrintCommand(msg)));
        }
        Ok(())
    }
}
