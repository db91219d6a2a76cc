// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, Result};

pub(crate) fn extract(bytes: &[u8]) -> Result<String> {
    // pdf-extract panics on some malformed inputs instead of erroring.
    match catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes))) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(anyhow!("{e}")),
        Err(_) => Err(anyhow!("parser aborted on invalid PDF structure")),
    }
}
