//! Template loading and placeholder substitution.
//!
//! Placeholders use the `{{ name }}` form. Block and comment tags (`{% %}`,
//! `{# #}`) are rejected rather than silently copied into the output.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

use super::context::RenderContext;

/// Part that every Word package must carry.
pub const DOCX_MAIN_PART: &str = "word/document.xml";

lazy_static! {
    static ref TAG_OPEN: Regex = Regex::new(r"\{[{%#]").unwrap();
    static ref PLACEHOLDER_NAME: Regex = Regex::new(r"^[\p{L}_][\p{L}\p{N}_.\-]*$").unwrap();
    static ref XML_TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref SPLIT_OPEN: Regex = Regex::new(r"\{(?:<[^>]*>)+([{%#])").unwrap();
    static ref SPLIT_CLOSE: Regex = Regex::new(r"([}%#])(?:<[^>]*>)+\}").unwrap();
}

/// Errors raised while loading a template (fatal for the run).
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported template format '{0}' (expected .docx or a text format)")]
    UnsupportedFormat(String),
    #[error("template is not a valid Word package: {0}")]
    NotAPackage(#[source] ZipError),
    #[error("template package has no {DOCX_MAIN_PART} part")]
    MissingDocumentPart,
    #[error("text template is not valid UTF-8")]
    NotUtf8,
}

/// Errors raised while substituting one document (recoverable per row).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unterminated placeholder starting at byte {offset}")]
    Unterminated { offset: usize },
    #[error("malformed placeholder expression '{0}'")]
    MalformedExpression(String),
    #[error("unsupported template tag '{0}'")]
    UnsupportedTag(String),
    #[error("part {part} is not valid UTF-8")]
    NotUtf8 { part: String },
    #[error("template package error: {0}")]
    Package(#[from] ZipError),
    #[error("I/O error while rendering: {0}")]
    Io(#[from] std::io::Error),
}

/// How a template is stored and rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateFormat {
    /// Office Open XML word-processing package.
    Docx,
    /// UTF-8 text. Markup formats get their substituted values escaped.
    Text {
        extension: String,
        escape_markup: bool,
    },
}

impl TemplateFormat {
    pub fn from_filename(filename: &str) -> Result<Self, TemplateError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "docx" => Ok(Self::Docx),
            "html" | "htm" | "xml" | "svg" => Ok(Self::Text {
                extension,
                escape_markup: true,
            }),
            "txt" | "md" | "tex" | "typ" | "csv" => Ok(Self::Text {
                extension,
                escape_markup: false,
            }),
            _ => Err(TemplateError::UnsupportedFormat(filename.to_string())),
        }
    }

    /// Extension given to rendered documents.
    pub fn extension(&self) -> &str {
        match self {
            Self::Docx => "docx",
            Self::Text { extension, .. } => extension,
        }
    }
}

/// A loaded, validated template. Cheap to clone; the bytes are shared and
/// never mutated, so one instance serves every row of a run.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    format: TemplateFormat,
    bytes: Arc<[u8]>,
}

impl Template {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self, TemplateError> {
        let name = name.into();
        let format = TemplateFormat::from_filename(&name)?;

        match &format {
            TemplateFormat::Docx => {
                let mut package =
                    ZipArchive::new(Cursor::new(bytes.as_slice())).map_err(TemplateError::NotAPackage)?;
                if package.by_name(DOCX_MAIN_PART).is_err() {
                    return Err(TemplateError::MissingDocumentPart);
                }
            }
            TemplateFormat::Text { .. } => {
                std::str::from_utf8(&bytes).map_err(|_| TemplateError::NotUtf8)?;
            }
        }

        Ok(Self {
            name,
            format,
            bytes: bytes.into(),
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_bytes(name, bytes)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &TemplateFormat {
        &self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Every placeholder name referenced by the template.
    pub fn placeholders(&self) -> Result<BTreeSet<String>, EngineError> {
        let mut names = BTreeSet::new();
        let mut collect = |name: &str| {
            names.insert(name.to_string());
            String::new()
        };

        match &self.format {
            TemplateFormat::Docx => {
                let mut package = ZipArchive::new(Cursor::new(&self.bytes[..]))?;
                for index in 0..package.len() {
                    let mut entry = package.by_index(index)?;
                    if !is_word_text_part(entry.name()) {
                        continue;
                    }
                    let part = entry.name().to_string();
                    let mut xml = String::new();
                    std::io::Read::read_to_string(&mut entry, &mut xml)
                        .map_err(|_| EngineError::NotUtf8 { part })?;
                    expand(&xml, SubstitutionMode::WordXml, &mut collect)?;
                }
            }
            TemplateFormat::Text { .. } => {
                let text = std::str::from_utf8(&self.bytes).map_err(|_| EngineError::NotUtf8 {
                    part: self.name.clone(),
                })?;
                expand(text, SubstitutionMode::Plain, &mut collect)?;
            }
        }

        Ok(names)
    }
}

/// Whether a package entry holds body text that may carry placeholders.
pub fn is_word_text_part(name: &str) -> bool {
    lazy_static! {
        static ref TEXT_PART: Regex =
            Regex::new(r"^word/(document|header\d*|footer\d*|footnotes|endnotes)\.xml$").unwrap();
    }
    TEXT_PART.is_match(name)
}

/// How values are inserted and placeholders located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstitutionMode {
    /// Values inserted verbatim.
    Plain,
    /// Values escaped for HTML/XML.
    Markup,
    /// Values escaped; tags splitting a placeholder (Word runs) are dropped,
    /// including tags between the two braces of `{{` or `}}`.
    WordXml,
}

/// Replace every placeholder in `source` using `context`, missing keys blank.
pub fn substitute(
    source: &str,
    context: &RenderContext,
    mode: SubstitutionMode,
) -> Result<String, EngineError> {
    let escape = mode != SubstitutionMode::Plain;
    expand(source, mode, |name| {
        let value = context.resolve(name);
        if escape {
            escape_markup(value)
        } else {
            value.to_string()
        }
    })
}

fn expand<F>(source: &str, mode: SubstitutionMode, mut replace: F) -> Result<String, EngineError>
where
    F: FnMut(&str) -> String,
{
    let joined;
    let source = if mode == SubstitutionMode::WordXml {
        joined = join_split_delimiters(source);
        &*joined
    } else {
        source
    };

    let mut output = String::with_capacity(source.len());
    let mut cursor = 0;

    while let Some(open) = TAG_OPEN.find_at(source, cursor) {
        output.push_str(&source[cursor..open.start()]);

        if open.as_str() != "{{" {
            return Err(EngineError::UnsupportedTag(open.as_str().to_string()));
        }

        let inner_start = open.end();
        let close = source[inner_start..]
            .find("}}")
            .map(|relative| inner_start + relative)
            .ok_or(EngineError::Unterminated {
                offset: open.start(),
            })?;

        let raw = &source[inner_start..close];
        let stripped = if mode == SubstitutionMode::WordXml {
            XML_TAG.replace_all(raw, "")
        } else {
            raw.into()
        };
        let name = stripped.trim();
        if !PLACEHOLDER_NAME.is_match(name) {
            return Err(EngineError::MalformedExpression(name.to_string()));
        }

        output.push_str(&replace(name));
        cursor = close + 2;
    }

    output.push_str(&source[cursor..]);
    Ok(output)
}

/// Drop markup sitting between the braces of a tag delimiter, so that
/// `{</w:t></w:r><w:r><w:t>{` reads as `{{`. The removed tags always close
/// and reopen the same run, which keeps the part well-formed.
fn join_split_delimiters(xml: &str) -> Cow<'_, str> {
    match SPLIT_OPEN.replace_all(xml, "{${1}") {
        Cow::Borrowed(xml) => SPLIT_CLOSE.replace_all(xml, "${1}}"),
        Cow::Owned(xml) => Cow::Owned(SPLIT_CLOSE.replace_all(&xml, "${1}}").into_owned()),
    }
}

/// Escape special characters for XML text and attribute values.
pub fn escape_markup(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RenderContext {
        [("Name", "Ada Lovelace"), ("Course", "R&D <101>")]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_substitute_plain() {
        let out = substitute("Dear {{Name}}, welcome to {{ Course }}.", &context(), SubstitutionMode::Plain)
            .unwrap();
        assert_eq!(out, "Dear Ada Lovelace, welcome to R&D <101>.");
    }

    #[test]
    fn test_missing_placeholder_renders_blank() {
        let out = substitute("Tel: {{ Phone }}!", &context(), SubstitutionMode::Plain).unwrap();
        assert_eq!(out, "Tel: !");
    }

    #[test]
    fn test_markup_values_are_escaped() {
        let out = substitute("<p>{{ Course }}</p>", &context(), SubstitutionMode::Markup).unwrap();
        assert_eq!(out, "<p>R&amp;D &lt;101&gt;</p>");
    }

    #[test]
    fn test_split_word_runs_are_joined() {
        let xml = r#"<w:t>Hi {{ Na</w:t></w:r><w:proofErr w:type="spellStart"/><w:r><w:t>me }}!</w:t>"#;
        let out = substitute(xml, &context(), SubstitutionMode::WordXml).unwrap();
        assert_eq!(out, "<w:t>Hi Ada Lovelace!</w:t>");
    }

    #[test]
    fn test_split_opening_braces_are_joined() {
        let xml = "<w:r><w:t>Hi {</w:t></w:r><w:r><w:t>{ Name }}!</w:t></w:r>";
        let out = substitute(xml, &context(), SubstitutionMode::WordXml).unwrap();
        assert_eq!(out, "<w:r><w:t>Hi Ada Lovelace!</w:t></w:r>");
    }

    #[test]
    fn test_split_closing_braces_are_joined() {
        let xml = "<w:r><w:t>A {{ Name }</w:t></w:r><w:r><w:t>} and {{ Name }}</w:t></w:r>";
        let out = substitute(xml, &context(), SubstitutionMode::WordXml).unwrap();
        assert_eq!(out, "<w:r><w:t>A Ada Lovelace and Ada Lovelace</w:t></w:r>");
    }

    #[test]
    fn test_split_block_tag_still_rejected() {
        let xml = "<w:t>{</w:t><w:t>% if x %}</w:t>";
        let err = substitute(xml, &context(), SubstitutionMode::WordXml).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedTag(tag) if tag == "{%"));
    }

    #[test]
    fn test_plain_mode_keeps_markup_between_braces() {
        let out = substitute("{<b>{ Name }</b>}", &context(), SubstitutionMode::Plain).unwrap();
        assert_eq!(out, "{<b>{ Name }</b>}");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let err = substitute("abc {{ Name", &context(), SubstitutionMode::Plain).unwrap_err();
        assert!(matches!(err, EngineError::Unterminated { offset: 4 }));
    }

    #[test]
    fn test_malformed_expressions() {
        for source in ["{{ }}", "{{ first name }}", "{{ Name | upper }}", "{{ 1abc }}"] {
            let err = substitute(source, &context(), SubstitutionMode::Plain).unwrap_err();
            assert!(matches!(err, EngineError::MalformedExpression(_)), "{source}");
        }
    }

    #[test]
    fn test_block_tags_rejected() {
        let err = substitute("{% if x %}", &context(), SubstitutionMode::Plain).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedTag(tag) if tag == "{%"));
    }

    #[test]
    fn test_unicode_and_dotted_names() {
        let ctx: RenderContext = [("Città", "Roma"), ("data.nascita", "1990")].into_iter().collect();
        let out = substitute("{{Città}} {{data.nascita}}", &ctx, SubstitutionMode::Plain).unwrap();
        assert_eq!(out, "Roma 1990");
    }

    #[test]
    fn test_lone_braces_pass_through() {
        let out = substitute("a { b } c }}", &context(), SubstitutionMode::Plain).unwrap();
        assert_eq!(out, "a { b } c }}");
    }

    #[test]
    fn test_text_template_placeholders() {
        let template = Template::from_bytes("letter.txt", b"{{ b }} {{a}} {{ b }}".to_vec()).unwrap();
        let names: Vec<_> = template.placeholders().unwrap().into_iter().collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_format_from_filename() {
        assert_eq!(TemplateFormat::from_filename("T.DOCX").unwrap(), TemplateFormat::Docx);
        assert_eq!(TemplateFormat::from_filename("page.html").unwrap().extension(), "html");
        assert!(TemplateFormat::from_filename("legacy.doc").is_err());
    }

    #[test]
    fn test_invalid_docx_rejected() {
        let err = Template::from_bytes("broken.docx", b"not a zip".to_vec()).unwrap_err();
        assert!(matches!(err, TemplateError::NotAPackage(_)));
    }

    #[test]
    fn test_non_utf8_text_rejected() {
        let err = Template::from_bytes("bad.txt", vec![0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, TemplateError::NotUtf8));
    }

    #[test]
    fn test_word_text_parts() {
        assert!(is_word_text_part("word/document.xml"));
        assert!(is_word_text_part("word/header2.xml"));
        assert!(is_word_text_part("word/footnotes.xml"));
        assert!(!is_word_text_part("word/styles.xml"));
        assert!(!is_word_text_part("word/_rels/document.xml.rels"));
    }
}
