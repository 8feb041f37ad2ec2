//! Print commands from the control topic: authorization, document
//! resolution and dispatch to the printer.
use crate::config::PrintCfg;
use crate::error::AgentError;
use crate::io_error::{Seam, map_io_error};
use crate::publisher::PrintCommand;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use std::sync::Arc;
use weigh_traits::{DocumentFetcher, Printer};

const PDF_MAGIC: &[u8] = b"%PDF";

/// Strip anything before the `%PDF` header; error when there is none.
pub fn pdf_body(doc: &[u8]) -> Result<&[u8], AgentError> {
    if doc.starts_with(PDF_MAGIC) {
        return Ok(doc);
    }
    doc.windows(PDF_MAGIC.len())
        .position(|w| w == PDF_MAGIC)
        .map(|i| &doc[i..])
        .ok_or_else(|| AgentError::Print("not a PDF stream".into()))
}

/// Byte comparison whose running time does not depend on where the inputs differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub struct PrintBridge {
    cfg: PrintCfg,
    printer: Arc<dyn Printer>,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
}

impl PrintBridge {
    pub fn new(cfg: PrintCfg, printer: Arc<dyn Printer>, fetcher: Option<Arc<dyn DocumentFetcher>>) -> Self {
        Self { cfg, printer, fetcher }
    }

    pub fn authorize(&self, cmd: &PrintCommand) -> Result<(), AgentError> {
        match cmd.secret.as_deref() {
            Some(s) if !s.is_empty() && constant_time_eq(s.as_bytes(), self.cfg.secret.as_bytes()) => Ok(()),
            _ => Err(AgentError::Rejected("invalid print secret".into())),
        }
    }

    /// Inline `pdfBase64` wins over `pdfUrl`.
    pub fn resolve_document(&self, cmd: &PrintCommand) -> Result<Vec<u8>, AgentError> {
        if let Some(b64) = cmd.pdf_base64.as_deref().filter(|s| !s.is_empty()) {
            return B64
                .decode(b64.trim())
                .map_err(|e| AgentError::Print(format!("invalid pdfBase64: {e}")));
        }
        if let Some(url) = cmd.pdf_url.as_deref().filter(|s| !s.is_empty()) {
            let fetcher = self
                .fetcher
                .as_ref()
                .ok_or_else(|| AgentError::Print("pdfUrl given but no document fetcher configured".into()))?;
            let headers: Vec<(String, String)> =
                cmd.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            return fetcher.fetch(url, &headers).map_err(|e| {
                AgentError::Print(format!("download pdfUrl failed: {}", map_io_error(Seam::Http, &*e)))
            });
        }
        Err(AgentError::Print("missing pdfBase64 or pdfUrl".into()))
    }

    /// Authorize, resolve and print. The command's printer hint overrides the default.
    pub fn handle(&self, cmd: &PrintCommand) -> Result<(), AgentError> {
        self.authorize(cmd)?;
        let doc = self.resolve_document(cmd)?;
        let body = pdf_body(&doc)?;
        let printer = cmd
            .printer
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(self.cfg.default_printer.as_deref());
        self.printer
            .print(body, printer)
            .map_err(|e| map_io_error(Seam::Print, &*e))?;
        tracing::info!(printer = printer.unwrap_or("default"), bytes = body.len(), "document printed");
        Ok(())
    }
}
