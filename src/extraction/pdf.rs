use super::{ExtractedContent, ExtractionError, PageImage};
use crate::classify::suffix;
use crate::model::PageWindow;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_TRAILER: &[u8] = b"%%EOF";
const TRAILER_SCAN_BYTES: usize = 2048;
const OFFICE_SUFFIXES: &[&str] = &["docx", "doc", "odt", "pptx", "ppt", "odp", "rtf"];

/// Renders paged documents to JPEG page images using poppler and LibreOffice.
#[derive(Debug, Clone)]
pub struct PageRenderer {
    dpi: u32,
    pdfinfo: String,
    pdftoppm: String,
    soffice: String,
}

impl PageRenderer {
    /// Renderer using the tools found on `PATH`.
    pub fn new(dpi: u32) -> Self {
        Self {
            dpi,
            pdfinfo: "pdfinfo".into(),
            pdftoppm: "pdftoppm".into(),
            soffice: "libreoffice".into(),
        }
    }

    /// Render the pages selected by `window`.
    ///
    /// Office documents are converted to PDF first. Structural checks run before any page is
    /// rendered, so a truncated file fails fast with [`ExtractionError::CorruptSource`].
    pub async fn render(
        &self,
        name: &str,
        bytes: Vec<u8>,
        window: PageWindow,
    ) -> Result<ExtractedContent, ExtractionError> {
        let is_office = !bytes.starts_with(PDF_MAGIC)
            && suffix(name).is_some_and(|ext| OFFICE_SUFFIXES.contains(&ext.as_str()));
        if !is_office {
            check_pdf_structure(&bytes)?;
        }

        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join(input_file_name(name, is_office));
        tokio::fs::write(&input, &bytes).await?;

        let pdf_path = if is_office {
            let converted = self.convert_to_pdf(&input, workdir.path()).await?;
            check_pdf_structure(&tokio::fs::read(&converted).await?)?;
            converted
        } else {
            input
        };

        let total_pages = self.page_count(&pdf_path).await?;
        let pages = window.select(total_pages);
        if pages.is_empty() {
            return Err(ExtractionError::CorruptSource(format!("{name} has no pages")));
        }

        let mut images = Vec::with_capacity(pages.len());
        for page in pages {
            images.push(self.render_page(&pdf_path, workdir.path(), page).await?);
        }
        tracing::debug!(document = name, total_pages, rendered = images.len(), "Rendered pages");

        Ok(ExtractedContent::Pages {
            images,
            total_pages,
        })
    }

    async fn convert_to_pdf(
        &self,
        input: &Path,
        outdir: &Path,
    ) -> Result<PathBuf, ExtractionError> {
        let output = run_tool(
            &self.soffice,
            [
                OsStr::new("--headless"),
                OsStr::new("--nodefault"),
                OsStr::new("--convert-to"),
                OsStr::new("pdf"),
                OsStr::new("--outdir"),
                outdir.as_os_str(),
                input.as_os_str(),
            ],
        )
        .await?;
        let converted = input.with_extension("pdf");
        if !output.status.success() || !converted.exists() {
            return Err(ExtractionError::CorruptSource(format!(
                "conversion to PDF failed: {}",
                stderr_summary(&output)
            )));
        }
        Ok(converted)
    }

    async fn page_count(&self, pdf: &Path) -> Result<u32, ExtractionError> {
        let output = run_tool(&self.pdfinfo, [pdf.as_os_str()]).await?;
        if !output.status.success() {
            return Err(ExtractionError::CorruptSource(format!(
                "unreadable PDF: {}",
                stderr_summary(&output)
            )));
        }
        parse_page_count(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ExtractionError::CorruptSource("page count missing from document info".into())
        })
    }

    async fn render_page(
        &self,
        pdf: &Path,
        workdir: &Path,
        page: u32,
    ) -> Result<PageImage, ExtractionError> {
        let page_arg = page.to_string();
        let dpi_arg = self.dpi.to_string();
        let prefix = workdir.join(format!("page-{page}"));
        let output = run_tool(
            &self.pdftoppm,
            [
                OsStr::new("-jpeg"),
                OsStr::new("-r"),
                OsStr::new(&dpi_arg),
                OsStr::new("-f"),
                OsStr::new(&page_arg),
                OsStr::new("-l"),
                OsStr::new(&page_arg),
                OsStr::new("-singlefile"),
                pdf.as_os_str(),
                prefix.as_os_str(),
            ],
        )
        .await?;
        if !output.status.success() {
            return Err(ExtractionError::CorruptSource(format!(
                "page {page} could not be rendered: {}",
                stderr_summary(&output)
            )));
        }
        let data = tokio::fs::read(prefix.with_extension("jpg")).await?;
        Ok(PageImage {
            page,
            media_type: "image/jpeg".into(),
            data,
        })
    }
}

/// Cheap structural check: a PDF must start with its magic header and carry an end-of-file
/// marker near the end.
pub fn check_pdf_structure(bytes: &[u8]) -> Result<(), ExtractionError> {
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ExtractionError::CorruptSource("missing PDF header".into()));
    }
    let tail_start = bytes.len().saturating_sub(TRAILER_SCAN_BYTES);
    let tail = &bytes[tail_start..];
    if !tail
        .windows(PDF_TRAILER.len())
        .any(|window| window == PDF_TRAILER)
    {
        return Err(ExtractionError::CorruptSource(
            "missing end-of-file marker, the document looks truncated".into(),
        ));
    }
    Ok(())
}

/// Extract the `Pages:` value from `pdfinfo` output.
pub fn parse_page_count(info: &str) -> Option<u32> {
    info.lines().find_map(|line| {
        let value = line.strip_prefix("Pages:")?;
        value.trim().parse().ok()
    })
}

fn input_file_name(name: &str, is_office: bool) -> String {
    if is_office {
        let ext = suffix(name).unwrap_or_else(|| "docx".into());
        format!("input.{ext}")
    } else {
        "input.pdf".into()
    }
}

async fn run_tool<I, S>(program: &str, args: I) -> Result<Output, ExtractionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                ExtractionError::Io(format!("`{program}` is not installed"))
            } else {
                ExtractionError::Io(format!("running `{program}`: {error}"))
            }
        })
}

fn stderr_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        format!("exit status {}", output.status)
    } else {
        trimmed.lines().take(3).collect::<Vec<_>>().join(" | ")
    }
}
