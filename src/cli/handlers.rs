use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use inquire::error::InquireResult;
use serde::Serialize;

use crate::{
    document::{Document, MetadataFilter},
    pool::CancelFlag,
    profile::{LinkedinRecord, ScholarExport},
    retrieval::SearchRequest,
    service::ExpertService,
    versioning::VersionMessage,
};

use super::InputFormat;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn read_documents(file: &Path, format: InputFormat) -> Result<Vec<Document>> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("failed to open {}", file.display()))?,
    );

    let documents = match format {
        InputFormat::Jsonl => {
            let mut documents = Vec::new();
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let document: Document = serde_json::from_str(&line)
                    .with_context(|| format!("{}:{}: not a document", file.display(), n + 1))?;
                documents.push(document);
            }
            documents
        }
        InputFormat::Linkedin => {
            let records: Vec<LinkedinRecord> = serde_json::from_reader(reader)
                .with_context(|| format!("{} is not a list of LinkedIn profiles", file.display()))?;
            records.into_iter().filter_map(LinkedinRecord::into_document).collect()
        }
        InputFormat::Scholar => {
            let export: ScholarExport = serde_json::from_reader(reader)
                .with_context(|| format!("{} is not a Scholar export", file.display()))?;
            let mut documents = export.publication_documents();
            documents.extend(export.author_documents());
            documents
        }
    };

    Ok(documents)
}

pub fn handle_ingest(
    service: &ExpertService,
    file: &Path,
    format: InputFormat,
    version: bool,
    source: Option<String>,
    message: Option<String>,
) -> Result<()> {
    let documents = read_documents(file, format)?;
    if documents.is_empty() {
        println!("nothing to ingest");
        return Ok(());
    }

    let total = documents.len();
    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!("embedding and writing {total} documents"));

    let message = VersionMessage {
        source: source.or_else(|| Some(format!("{format:?}").to_lowercase())),
        description: None,
        message,
    };
    let result = service.ingest_documents(documents, version, &message, &CancelFlag::new());
    spinner.finish_and_clear();

    let outcome = result?;
    println!("{} of {} documents written", outcome.written, total);
    for failed in &outcome.failed {
        eprintln!("failed {}: {}", failed.id, failed.reason);
    }
    if let Some(record) = &outcome.version {
        println!(
            "version {} ({:?}): {}",
            record.commit_id, record.durability, record.message
        );
    }
    Ok(())
}

pub fn handle_search(
    service: &ExpertService,
    query: String,
    initial_k: Option<usize>,
    final_k: Option<usize>,
    filter: Option<String>,
) -> Result<()> {
    let filters = match filter {
        Some(filter) => {
            let value: serde_json::Value = serde_json::from_str(&filter).context("--filter is not valid JSON")?;
            MetadataFilter::from_json(&value)?
        }
        None => MetadataFilter::default(),
    };

    let request = SearchRequest {
        query,
        initial_k,
        final_k,
        filters,
    };
    let response = service.search(&request, &CancelFlag::new())?;

    if response.degraded {
        eprintln!("reranker unavailable: results are in vector search order");
    }
    if response.stale_statistics {
        eprintln!("credibility statistics are stale, run `expertdb refresh-stats`");
    }
    print_json(&response)
}

pub fn handle_versions(service: &ExpertService, max_entries: Option<usize>) -> Result<()> {
    print_json(&service.list_versions(max_entries)?)
}

pub fn handle_restore(service: &ExpertService, commit_id: &str) -> Result<()> {
    let outcome = service.restore_to(commit_id)?;
    if outcome.already_active {
        println!("collection already at {}", outcome.commit_id);
    } else {
        println!(
            "restored {} ({} documents)",
            outcome.commit_id, outcome.document_count
        );
    }
    Ok(())
}

pub fn handle_refresh_stats(service: &ExpertService) -> Result<()> {
    print_json(&service.refresh_credibility_statistics()?)
}

pub fn handle_count(service: &ExpertService) -> Result<()> {
    println!("{}", service.count()?);
    Ok(())
}

pub fn handle_reset(service: &ExpertService, yes: bool) -> Result<()> {
    let count = service.count()?;
    if !yes {
        match inquire::prompt_confirmation(format!(
            "You are about to delete every document ({count} items). Are you really sure?"
        )) {
            InquireResult::Ok(true) => {}
            InquireResult::Ok(false) => return Ok(()),
            InquireResult::Err(err) => bail!("An error occurred: {}", err),
        }
    }

    service.reset()?;
    println!("{count} documents deleted");
    Ok(())
}

pub fn handle_values(service: &ExpertService, field: &str) -> Result<()> {
    print_json(&service.metadata_values(field)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_jsonl_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("docs.jsonl");
        std::fs::write(
            &file,
            "{\"id\": \"a\", \"content\": \"first\", \"metadata\": {\"doc_type\": \"author\", \"name\": \"Ada\"}}\n\n{\"id\": \"b\", \"content\": \"second\"}\n",
        )
        .unwrap();

        let docs = read_documents(&file, InputFormat::Jsonl).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].metadata.as_ref().unwrap().doc_type(), "author");
        assert!(docs[1].metadata.is_none());
    }

    #[test]
    fn test_read_jsonl_reports_bad_line() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("docs.jsonl");
        std::fs::write(&file, "{\"id\": \"a\", \"content\": \"ok\"}\nnot json\n").unwrap();

        let err = read_documents(&file, InputFormat::Jsonl).unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }

    #[test]
    fn test_read_linkedin_skips_records_without_id() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("profiles.json");
        std::fs::write(
            &file,
            r#"[{"urn_id": "u1", "full_name": "Ada"}, {"full_name": "Nobody"}]"#,
        )
        .unwrap();

        let docs = read_documents(&file, InputFormat::Linkedin).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "u1");
    }
}
