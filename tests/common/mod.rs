#![allow(dead_code)]

use morph_check::{
    converter::{ConvertOutput, ConvertRequest, Converter},
    error::{ConvertError, ValidationError},
    format::Format,
    validate::{QualityReport, Scorer},
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What a scripted converter does when invoked.
#[derive(Debug, Clone)]
pub enum Step {
    /// Writes an output whose content is the score the [`FileScorer`] will report.
    Score(f64),
    ScoreWithWarning(f64, &'static str),
    Fail(&'static str),
    Timeout,
    Unavailable,
    Panic,
}

pub struct ScriptedConverter {
    name: String,
    step: Step,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<PathBuf>>,
}

impl ScriptedConverter {
    pub fn new(name: &str, step: Step) -> Self {
        Self {
            name: name.to_string(),
            step,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sources(&self) -> Vec<PathBuf> {
        self.seen.lock().unwrap().clone()
    }
}

impl Converter for ScriptedConverter {
    fn name(&self) -> &str {
        &self.name
    }

    fn convert(&self, req: &ConvertRequest<'_>) -> Result<ConvertOutput, ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req.source.to_path_buf());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match &self.step {
            Step::Score(score) => {
                std::fs::write(&req.output, score.to_string()).unwrap();
                Ok(ConvertOutput {
                    path: req.output.clone(),
                    warnings: Vec::new(),
                })
            }
            Step::ScoreWithWarning(score, warning) => {
                std::fs::write(&req.output, score.to_string()).unwrap();
                Ok(ConvertOutput {
                    path: req.output.clone(),
                    warnings: vec![warning.to_string()],
                })
            }
            Step::Fail(reason) => Err(ConvertError::Failed(reason.to_string())),
            Step::Timeout => Err(ConvertError::Timeout),
            Step::Unavailable => Err(ConvertError::Unavailable(format!("{} missing", self.name))),
            Step::Panic => panic!("converter {} blew up", self.name),
        }
    }
}

/// Reads the score a [`ScriptedConverter`] wrote into its output.
pub struct FileScorer;

impl Scorer for FileScorer {
    fn score(
        &self,
        _source: &Path,
        output: &Path,
        _source_format: Format,
        _target_format: Format,
    ) -> Result<QualityReport, ValidationError> {
        let raw = std::fs::read_to_string(output).map_err(|source| ValidationError::Unreadable {
            path: output.to_path_buf(),
            source,
        })?;
        let score: f64 = raw.trim().parse().unwrap_or(0.0);
        Ok(QualityReport::from_score(score))
    }
}

/// Writes a minimal Word document with one heading and one table.
pub fn write_docx(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    zip.start_file("[Content_Types].xml", options).unwrap();
    zip.write_all(br#"<?xml version="1.0" encoding="UTF-8"?><Types/>"#)
        .unwrap();
    zip.start_file("word/document.xml", options).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Quarterly report</w:t></w:r></w:p>
    <w:p><w:r><w:t>Revenue grew in every region.</w:t></w:r></w:p>
    <w:tbl><w:tr><w:tc><w:p><w:r><w:t>North</w:t></w:r></w:p></w:tc></w:tr></w:tbl>
  </w:body>
</w:document>"#,
    )
    .unwrap();
    zip.start_file("docProps/core.xml", options).unwrap();
    zip.write_all(
        br#"<?xml version="1.0" encoding="UTF-8"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <dc:title>Quarterly report</dc:title>
  <dc:creator>Finance</dc:creator>
</cp:coreProperties>"#,
    )
    .unwrap();
    zip.finish().unwrap();
}

pub const MERMAID: &str = "graph TD\n  A[Start] --> B[Review]\n  B --> C[Done]\n";

/// Builds a one-page PDF. `text` goes into the page's content stream; `None` paints a
/// single image instead, like a scanner would. `compress` Flate-encodes every stream.
pub fn pdf_bytes(text: Option<&str>, title: Option<&str>, compress: bool) -> Vec<u8> {
    use lopdf::{Document, Object, Stream, StringFormat, dictionary};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 1,
            "Height" => 1,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        vec![0x80],
    ));
    let (content, resources) = match text {
        Some(text) => (
            format!("BT /F1 12 Tf 50 700 Td ({text}) Tj ET"),
            dictionary! { "Font" => dictionary! { "F1" => font_id } },
        ),
        None => (
            "q 612 0 0 792 0 0 cm /Im1 Do Q".to_string(),
            dictionary! { "XObject" => dictionary! { "Im1" => image_id } },
        ),
    };
    // Padding keeps the stream compressible; lopdf skips streams that would not shrink.
    let content = format!("{content}\n{}", " ".repeat(256));
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        "Resources" => resources,
        "Contents" => content_id,
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    if let Some(title) = title {
        let info_id = doc.add_object(dictionary! {
            "Title" => Object::String(title.as_bytes().to_vec(), StringFormat::Literal),
        });
        doc.trailer.set("Info", info_id);
    }
    if compress {
        doc.compress();
    }

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

/// An image-only PDF with no text layer.
pub fn scanned_pdf() -> Vec<u8> {
    pdf_bytes(None, None, false)
}

pub fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}
