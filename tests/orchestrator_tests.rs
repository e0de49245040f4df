//! End-to-end runs of the batch pipeline over in-memory fixtures.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docmerge_server::merge::{
    ArchiveError, ArchiveStaging, BatchError, BatchOrchestrator, CancelFlag, ConversionError, Dataset,
    DocumentPayload, NoProgress, PostProcessor, RunOptions, RunOutput, RunState, Template,
};

use common::{document_text, entry_names, read_entry_bytes, simple_docx};

fn csv(text: &str) -> Dataset {
    Dataset::from_csv_bytes(text.as_bytes()).unwrap()
}

fn certificate() -> Template {
    Template::from_bytes(
        "certificate.docx",
        simple_docx(&["Certificate for {{ Name }}", "Phone: {{ Phone }}"]),
    )
    .unwrap()
}

fn run(dataset: &Dataset, template: &Template, options: RunOptions) -> RunOutput {
    BatchOrchestrator::new(options)
        .run(dataset, template, "Name", &NoProgress, &CancelFlag::new())
        .unwrap()
}

#[test]
fn test_duplicate_and_blank_names() {
    let dataset = csv("Name,Phone\nAlice,111\nAlice,222\n,333\n");
    let output = run(&dataset, &certificate(), RunOptions::default());

    assert_eq!(output.report.state, RunState::Completed);
    assert_eq!(output.output_names, vec!["Alice", "Alice_1", "row_3"]);

    let archive = output.archive.to_bytes().unwrap();
    assert_eq!(entry_names(&archive), vec!["Alice.docx", "Alice_1.docx", "row_3.docx"]);

    let second = read_entry_bytes(&archive, "Alice_1.docx");
    assert!(document_text(&second).contains("Phone: 222"));
}

#[test]
fn test_missing_column_renders_blank() {
    let dataset = csv("Name\nBob\n");
    let output = run(&dataset, &certificate(), RunOptions::default());

    assert_eq!(output.report.succeeded, 1);
    let archive = output.archive.to_bytes().unwrap();
    let text = document_text(&read_entry_bytes(&archive, "Bob.docx"));
    assert!(text.contains("Certificate for Bob"));
    assert!(text.contains("Phone: "));
    assert!(!text.contains("{{"));
}

#[test]
fn test_illegal_characters_in_names() {
    let dataset = csv("Name\n\"Mario/Rossi: \"\"CEO\"\"\"\n  ..hidden..  \nA*B?C|D\n");
    let output = run(&dataset, &certificate(), RunOptions::default());

    assert_eq!(output.output_names, vec!["Mario_Rossi_CEO", "hidden", "A_B_C_D"]);
    for name in &output.output_names {
        assert!(!name.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|', ' ']));
        assert!(!name.contains("__"));
    }
}

#[test]
fn test_empty_dataset() {
    let dataset = csv("Name,Phone\n");
    let output = run(&dataset, &certificate(), RunOptions::default());

    assert_eq!(output.report.state, RunState::Completed);
    assert_eq!(output.report.total, 0);
    assert_eq!(output.report.notice.as_deref(), Some("empty dataset"));
    assert!(output.archive.is_empty());
}

#[test]
fn test_every_row_failing() {
    let broken = Template::from_bytes("broken.docx", simple_docx(&["Hello {{ first name }}"])).unwrap();
    let dataset = csv("Name\nA\nB\nC\n");
    let output = run(&dataset, &broken, RunOptions::default());

    assert_eq!(output.report.state, RunState::CompletedWithErrors);
    assert_eq!(output.report.succeeded, 0);
    assert_eq!(output.report.failed, 3);
    assert!(output.archive.is_empty());

    let rows: HashSet<usize> = output.report.failures.iter().map(|failure| failure.row).collect();
    assert_eq!(rows, HashSet::from([1, 2, 3]));
}

#[test]
fn test_counts_add_up_with_mixed_rows() {
    let dataset = csv("Name,Phone\nA,1\nB,2\nC,3\nD,4\n");
    let output = run(&dataset, &certificate(), RunOptions::default());

    let report = &output.report;
    assert_eq!(report.succeeded + report.failed, report.total);
    assert_eq!(output.archive.len(), report.succeeded);
    let unique: HashSet<&String> = output.output_names.iter().collect();
    assert_eq!(unique.len(), output.output_names.len());
}

#[test]
fn test_batch_size_and_pause_do_not_change_output() {
    let dataset = csv("Name,Phone\nA,1\nA,2\nB,3\n,4\nC,5\n");
    let template = certificate();

    let baseline = run(&dataset, &template, RunOptions::default());
    let tuned = run(
        &dataset,
        &template,
        RunOptions {
            batch_size: 2,
            inter_row_pause: Duration::from_millis(1),
            ..RunOptions::default()
        },
    );

    assert_eq!(baseline.output_names, tuned.output_names);
    assert_eq!(baseline.archive.to_bytes().unwrap(), tuned.archive.to_bytes().unwrap());
}

#[test]
fn test_memory_and_disk_archives_match() {
    let dataset = csv("Name,Phone\nAda,1\nGrace,2\n");
    let template = certificate();

    let memory = run(&dataset, &template, RunOptions::default());
    let disk = run(
        &dataset,
        &template,
        RunOptions {
            staging: ArchiveStaging::Disk,
            ..RunOptions::default()
        },
    );

    assert!(disk.archive.staged_path().is_some());
    assert_eq!(memory.archive.to_bytes().unwrap(), disk.archive.to_bytes().unwrap());
}

#[test]
fn test_progress_reaches_total() {
    let dataset = csv("Name\nA\nB\nC\n");
    let seen = Mutex::new(Vec::new());
    let sink = |processed: usize, total: usize| seen.lock().unwrap().push((processed, total));

    BatchOrchestrator::new(RunOptions {
        batch_size: 1,
        ..RunOptions::default()
    })
    .run(&dataset, &certificate(), "Name", &sink, &CancelFlag::new())
    .unwrap();

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.last(), Some(&(3, 3)));
    assert!(seen.windows(2).all(|pair| pair[0].0 < pair[1].0));
}

#[test]
fn test_cancelled_run_leaves_rows_unprocessed() {
    let dataset = csv("Name\nA\nB\nC\nD\n");
    let cancel = CancelFlag::new();
    cancel.cancel();

    let output = BatchOrchestrator::new(RunOptions::default())
        .run(&dataset, &certificate(), "Name", &NoProgress, &cancel)
        .unwrap();

    assert_eq!(output.report.state, RunState::Cancelled);
    assert_eq!(output.report.processed, 1);
    assert!(output.report.processed < output.report.total);
    assert_eq!(output.archive.len(), 1);
}

#[test]
fn test_text_templates_keep_their_extension() {
    let dataset = Dataset::from_json_bytes(br#"[{"Name": "Ada", "Score": 9.5}, {"Name": "Grace"}]"#).unwrap();
    let template = Template::from_bytes("letter.md", b"# {{ Name }}\nScore: {{ Score }}\n".to_vec()).unwrap();
    let output = run(&dataset, &template, RunOptions::default());

    assert_eq!(output.archive.entries(), &["Ada.md", "Grace.md"]);
    let archive = output.archive.to_bytes().unwrap();
    assert_eq!(read_entry_bytes(&archive, "Grace.md"), b"# Grace\nScore: \n");
}

#[test]
fn test_inputs_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let dataset_path = dir.path().join("people.tsv");
    let template_path = dir.path().join("letter.html");
    std::fs::write(&dataset_path, "Name\tCity\nAda\tLondon\n").unwrap();
    std::fs::write(&template_path, "<p>{{ Name }} from {{ City }}</p>").unwrap();

    let dataset = Dataset::from_path(&dataset_path).unwrap();
    let template = Template::from_path(&template_path).unwrap();
    assert_eq!(template.name(), "letter.html");

    let output = run(&dataset, &template, RunOptions::default());
    let archive = output.archive.to_bytes().unwrap();
    assert_eq!(read_entry_bytes(&archive, "Ada.html"), b"<p>Ada from London</p>");
}

/// Upper-cases text documents and refuses the one named "Grace".
struct Shouting;

impl PostProcessor for Shouting {
    fn extension(&self) -> &str {
        "loud"
    }

    fn convert(&self, payload: &DocumentPayload) -> Result<Vec<u8>, ConversionError> {
        if payload.name == "Grace" {
            return Err(ConversionError::Exit(1));
        }
        Ok(payload.bytes.to_ascii_uppercase())
    }
}

#[test]
fn test_conversion_failure_does_not_fail_the_row() {
    let dataset = csv("Name\nAda\nGrace\nAlan\n");
    let template = Template::from_bytes("hello.txt", b"hello {{ Name }}".to_vec()).unwrap();

    let output = BatchOrchestrator::new(RunOptions::default())
        .with_post_processor(Arc::new(Shouting))
        .run(&dataset, &template, "Name", &NoProgress, &CancelFlag::new())
        .unwrap();

    let report = &output.report;
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.conversion_failed, 1);
    assert_eq!(report.conversion_failures[0].row, 2);
    assert_eq!(report.conversion_failures[0].output_name, "Grace");
    assert!(report.conversion_failures[0].error.contains("status 1"));

    assert_eq!(output.archive.len(), report.succeeded);
    let converted = output.converted.expect("converted archive");
    assert_eq!(converted.entries(), &["Ada.loud", "Alan.loud"]);
    let bytes = converted.to_bytes().unwrap();
    assert_eq!(read_entry_bytes(&bytes, "Alan.loud"), b"HELLO ALAN");
}

#[test]
fn test_archive_failure_aborts_with_partial_report() {
    let dataset = csv("Name\nA\nB\nC\nD\n");
    let template = Template::from_bytes("hello.txt", b"Hello {{ Name }}".to_vec()).unwrap();

    for staging in [ArchiveStaging::Memory, ArchiveStaging::Disk] {
        let err = BatchOrchestrator::new(RunOptions {
            staging,
            // room for exactly two 7-byte documents
            max_archive_bytes: Some(14),
            ..RunOptions::default()
        })
        .run(&dataset, &template, "Name", &NoProgress, &CancelFlag::new())
        .unwrap_err();

        assert!(
            matches!(&err, BatchError::Archive { source: ArchiveError::LimitExceeded { limit: 14 }, .. }),
            "{err}"
        );
        let report = err.partial_report().expect("partial report");
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.total, 4);
        assert!(err.to_string().starts_with("archive write failed after 2 documents"));
    }
}
