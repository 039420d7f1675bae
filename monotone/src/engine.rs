/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The dataflow engine boundary.
//!
//! The job needs four collection-level capabilities: load raw shards,
//! parse them in parallel, sort globally by key and then by the
//! ordering key, and write results. [`Engine`] names those
//! capabilities; [`LocalEngine`] provides them on the local
//! filesystem using the tokio runtime.

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::config::FieldNames;
use crate::config::ParseMode;
use crate::ordering::IngestIndex;
use crate::ordering::global_cmp;
use crate::projection::Verdict;
use crate::record::AugmentedObservation;
use crate::record::ParseError;
use crate::record::parse_observation;

/// Name of the empty marker written next to a complete output.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// The type of error for engine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("input location {0} does not exist")]
    MissingInput(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record at {}:{}: {source}", .path.display(), .line + 1)]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: ParseError,
    },

    #[error("output location {0} already exists")]
    OutputExists(PathBuf),

    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One input file, read whole. Contents are raw bytes; each line is
/// decoded on its own so one undecodable line is one bad record.
#[derive(Debug, Clone)]
pub struct Shard {
    /// Position of the shard in ascending file-name order.
    pub ordinal: usize,
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

/// A record that failed to parse in lenient mode.
#[derive(Debug)]
pub struct Rejection {
    pub path: PathBuf,
    pub line: usize,
    pub error: ParseError,
}

/// The result of parsing every shard.
#[derive(Debug, Default)]
pub struct ParsedInput {
    pub records: Vec<AugmentedObservation>,
    pub rejected: Vec<Rejection>,
}

/// Collection-level operations the job is built from.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Number of partitions the grouped fold is split into.
    fn parallelism(&self) -> usize;

    /// Read every shard under `location`, numbered in file-name order.
    async fn load(&self, location: &Path) -> Result<Vec<Shard>, EngineError>;

    /// Parse all shards into observations.
    async fn parse_all(
        &self,
        shards: Vec<Shard>,
        fields: &FieldNames,
        mode: ParseMode,
    ) -> Result<ParsedInput, EngineError>;

    /// Sort by key, then by ordering key.
    async fn sort_by_key_then_order(
        &self,
        records: Vec<AugmentedObservation>,
    ) -> Result<Vec<AugmentedObservation>, EngineError>;

    /// Fail if `location` is already taken.
    async fn check_output(&self, location: &Path) -> Result<(), EngineError>;

    /// Write `results` to `location` atomically, returning the number
    /// of result shards written.
    async fn write_all(
        &self,
        location: &Path,
        results: Vec<Verdict>,
        fields: &FieldNames,
    ) -> Result<usize, EngineError>;
}

/// An [`Engine`] over the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    parallelism: usize,
}

impl LocalEngine {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }
}

// Hadoop-style marker and hidden files are not data.
fn is_data_file(name: &str) -> bool {
    !(name.starts_with('.') || name.starts_with('_'))
}

async fn shard_paths(location: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let read_error = |source| EngineError::Read {
        path: location.to_path_buf(),
        source,
    };
    let metadata = match tokio::fs::metadata(location).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::MissingInput(location.to_path_buf()));
        }
        Err(e) => return Err(read_error(e)),
    };
    if metadata.is_file() {
        return Ok(vec![location.to_path_buf()]);
    }

    let mut entries = tokio::fs::read_dir(location).await.map_err(read_error)?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        let file_type = entry.file_type().await.map_err(read_error)?;
        let name = entry.file_name();
        if file_type.is_file() && is_data_file(&name.to_string_lossy()) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Parse every line of one shard. Blank lines are skipped. In strict
/// mode the first malformed line fails the shard.
pub fn parse_shard(
    shard: &Shard,
    fields: &FieldNames,
    mode: ParseMode,
) -> Result<ParsedInput, EngineError> {
    let mut parsed = ParsedInput::default();
    for (line, bytes) in shard.contents.split(|b| *b == b'\n').enumerate() {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        let record = match std::str::from_utf8(bytes) {
            Ok(text) if text.trim().is_empty() => continue,
            Ok(text) => parse_observation(text, fields),
            Err(e) => Err(ParseError::InvalidUtf8(e)),
        };
        match record {
            Ok(observation) => parsed.records.push(AugmentedObservation::ingest(
                observation,
                IngestIndex::new(shard.ordinal, line),
            )),
            Err(error) => match mode {
                ParseMode::Strict => {
                    return Err(EngineError::Parse {
                        path: shard.path.clone(),
                        line,
                        source: error,
                    });
                }
                ParseMode::Lenient => {
                    tracing::warn!(
                        "skipping malformed record at {}:{}: {}",
                        shard.path.display(),
                        line + 1,
                        error
                    );
                    parsed.rejected.push(Rejection {
                        path: shard.path.clone(),
                        line,
                        error,
                    });
                }
            },
        }
    }
    Ok(parsed)
}

/// Move a complete staging directory to `location`.
///
/// `rename(2)` replaces an empty directory at the destination, so the
/// destination is checked again just before the rename. A directory
/// created between that check and the rename is still replaced.
async fn publish(staged: PathBuf, location: &Path) -> Result<(), EngineError> {
    let result = match tokio::fs::try_exists(location).await {
        Ok(false) => tokio::fs::rename(&staged, location)
            .await
            .map_err(write_error(location)),
        Ok(true) => Err(EngineError::OutputExists(location.to_path_buf())),
        Err(source) => Err(EngineError::Read {
            path: location.to_path_buf(),
            source,
        }),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_dir_all(&staged).await;
    }
    result
}

fn write_error(path: &Path) -> impl Fn(std::io::Error) -> EngineError + '_ {
    move |source| EngineError::Write {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl Engine for LocalEngine {
    fn parallelism(&self) -> usize {
        self.parallelism
    }

    async fn load(&self, location: &Path) -> Result<Vec<Shard>, EngineError> {
        let paths = shard_paths(location).await?;
        let mut reads = JoinSet::new();
        for (ordinal, path) in paths.into_iter().enumerate() {
            reads.spawn(async move {
                match tokio::fs::read(&path).await {
                    Ok(contents) => Ok(Shard {
                        ordinal,
                        path,
                        contents,
                    }),
                    Err(source) => Err(EngineError::Read { path, source }),
                }
            });
        }

        let mut shards = Vec::with_capacity(reads.len());
        while let Some(read) = reads.join_next().await {
            shards.push(read??);
        }
        shards.sort_by_key(|shard| shard.ordinal);
        tracing::debug!("loaded {} shards from {}", shards.len(), location.display());
        Ok(shards)
    }

    async fn parse_all(
        &self,
        shards: Vec<Shard>,
        fields: &FieldNames,
        mode: ParseMode,
    ) -> Result<ParsedInput, EngineError> {
        let mut parses = JoinSet::new();
        for shard in shards {
            let fields = fields.clone();
            parses.spawn_blocking(move || (shard.ordinal, parse_shard(&shard, &fields, mode)));
        }

        let mut per_shard = Vec::with_capacity(parses.len());
        // Report the earliest failing shard so the error is the same on
        // every run.
        let mut first_error: Option<(usize, EngineError)> = None;
        while let Some(parse) = parses.join_next().await {
            let (ordinal, result) = parse?;
            match result {
                Ok(parsed) => per_shard.push((ordinal, parsed)),
                Err(e) => {
                    if first_error.as_ref().map_or(true, |(o, _)| ordinal < *o) {
                        first_error = Some((ordinal, e));
                    }
                }
            }
        }
        if let Some((_, e)) = first_error {
            return Err(e);
        }

        per_shard.sort_by_key(|(ordinal, _)| *ordinal);
        let mut input = ParsedInput::default();
        for (_, parsed) in per_shard {
            input.records.extend(parsed.records);
            input.rejected.extend(parsed.rejected);
        }
        Ok(input)
    }

    async fn sort_by_key_then_order(
        &self,
        records: Vec<AugmentedObservation>,
    ) -> Result<Vec<AugmentedObservation>, EngineError> {
        let sorted = tokio::task::spawn_blocking(move || {
            let mut records = records;
            // Ordering keys are unique per record, so an unstable sort
            // is deterministic.
            records.sort_unstable_by(global_cmp);
            records
        })
        .await?;
        Ok(sorted)
    }

    async fn check_output(&self, location: &Path) -> Result<(), EngineError> {
        match tokio::fs::try_exists(location).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(EngineError::OutputExists(location.to_path_buf())),
            Err(source) => Err(EngineError::Read {
                path: location.to_path_buf(),
                source,
            }),
        }
    }

    async fn write_all(
        &self,
        location: &Path,
        results: Vec<Verdict>,
        fields: &FieldNames,
    ) -> Result<usize, EngineError> {
        self.check_output(location).await?;
        let parent = match location.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(write_error(&parent))?;

        // Stage next to the destination so the final rename stays on
        // one filesystem.
        let staging = tempfile::Builder::new()
            .prefix(".monotone-staging-")
            .tempdir_in(&parent)
            .map_err(write_error(&parent))?;

        let shard_len = results.len().div_ceil(self.parallelism).max(1);
        let mut shards_written = 0;
        for (index, chunk) in results.chunks(shard_len).enumerate() {
            let path = staging.path().join(format!("part-{:05}", index));
            let mut contents = Vec::new();
            for verdict in chunk {
                serde_json::to_writer(&mut contents, &verdict.record(&fields.key))?;
                contents.push(b'\n');
            }
            tokio::fs::write(&path, contents)
                .await
                .map_err(write_error(&path))?;
            shards_written += 1;
        }
        let marker = staging.path().join(SUCCESS_MARKER);
        tokio::fs::write(&marker, b"")
            .await
            .map_err(write_error(&marker))?;

        publish(staging.keep(), location).await?;
        tracing::debug!(
            "wrote {} result shards to {}",
            shards_written,
            location.display()
        );
        Ok(shards_written)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn shard(ordinal: usize, contents: &str) -> Shard {
        Shard {
            ordinal,
            path: PathBuf::from(format!("part-{ordinal}")),
            contents: contents.as_bytes().to_vec(),
        }
    }

    fn verdict(key: &str, monotonic: bool) -> Verdict {
        Verdict {
            key: key.to_string(),
            monotonic,
        }
    }

    #[tokio::test]
    async fn test_load_orders_shards_and_skips_markers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), "second").unwrap();
        fs::write(dir.path().join("a.json"), "first").unwrap();
        fs::write(dir.path().join("_SUCCESS"), "").unwrap();
        fs::write(dir.path().join(".a.json.crc"), "x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let shards = LocalEngine::new(2).load(dir.path()).await.unwrap();
        let seen: Vec<(usize, &[u8])> = shards
            .iter()
            .map(|s| (s.ordinal, s.contents.as_slice()))
            .collect();
        assert_eq!(seen, vec![(0, &b"first"[..]), (1, &b"second"[..])]);
    }

    #[tokio::test]
    async fn test_load_single_file_and_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("events");
        fs::write(&file, "line").unwrap();
        let engine = LocalEngine::new(1);
        assert_eq!(engine.load(&file).await.unwrap().len(), 1);
        assert!(matches!(
            engine.load(&dir.path().join("absent")).await,
            Err(EngineError::MissingInput(_))
        ));
    }

    #[test]
    fn test_parse_shard_numbers_lines_and_skips_blanks() {
        let contents = concat!(
            r#"{"timestamp": 1, "website": "a", "users": 1}"#,
            "\n\n   \n",
            r#"{"timestamp": 2, "website": "a", "users": 2}"#,
            "\n",
        );
        let parsed = parse_shard(&shard(4, contents), &FieldNames::default(), ParseMode::Strict)
            .unwrap();
        let indices: Vec<IngestIndex> = parsed.records.iter().map(|r| r.order().ingest()).collect();
        assert_eq!(indices, vec![IngestIndex::new(4, 0), IngestIndex::new(4, 3)]);
        assert!(parsed.rejected.is_empty());
    }

    #[test]
    fn test_parse_shard_modes() {
        let contents = concat!(
            r#"{"timestamp": 1, "website": "a", "users": 1}"#,
            "\n",
            r#"{"timestamp": 2, "website": "a"}"#,
            "\n",
            r#"{"timestamp": 3, "website": "a", "users": 3}"#,
        );
        let strict = parse_shard(&shard(0, contents), &FieldNames::default(), ParseMode::Strict);
        match strict {
            Err(EngineError::Parse { line, source, .. }) => {
                assert_eq!(line, 1);
                assert!(matches!(source, ParseError::MissingField { .. }));
            }
            other => panic!("expected parse error, got {other:?}"),
        }

        let lenient =
            parse_shard(&shard(0, contents), &FieldNames::default(), ParseMode::Lenient).unwrap();
        assert_eq!(lenient.records.len(), 2);
        assert_eq!(lenient.rejected.len(), 1);
        assert_eq!(lenient.rejected[0].line, 1);
    }

    #[test]
    fn test_parse_shard_decodes_each_line() {
        let mut contents = br#"{"timestamp": 1, "website": "a", "users": 1}"#.to_vec();
        contents.extend_from_slice(b"\r\n\xff\xfe garbage\n");
        contents.extend_from_slice(br#"{"timestamp": 2, "website": "a", "users": 2}"#);
        let bad = Shard {
            ordinal: 0,
            path: PathBuf::from("part-0"),
            contents,
        };

        match parse_shard(&bad, &FieldNames::default(), ParseMode::Strict) {
            Err(EngineError::Parse { line, source, .. }) => {
                assert_eq!(line, 1);
                assert!(matches!(source, ParseError::InvalidUtf8(_)));
            }
            other => panic!("expected parse error, got {other:?}"),
        }

        let lenient = parse_shard(&bad, &FieldNames::default(), ParseMode::Lenient).unwrap();
        let lines: Vec<usize> = lenient
            .records
            .iter()
            .map(|r| r.order().ingest().line())
            .collect();
        assert_eq!(lines, vec![0, 2]);
        assert_eq!(lenient.rejected.len(), 1);
        assert_eq!(lenient.rejected[0].line, 1);
    }

    #[tokio::test]
    async fn test_publish_refuses_destination_created_after_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join(".monotone-staging-x");
        fs::create_dir(&staged).unwrap();
        fs::write(staged.join(SUCCESS_MARKER), "").unwrap();
        let out = dir.path().join("results");
        fs::create_dir(&out).unwrap();

        let err = publish(staged.clone(), &out).await.unwrap_err();
        assert!(matches!(err, EngineError::OutputExists(_)), "{err}");
        assert!(!staged.exists());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_parse_all_reports_earliest_shard_error() {
        let good = r#"{"timestamp": 1, "website": "a", "users": 1}"#;
        let shards = vec![shard(0, good), shard(1, "oops"), shard(2, "{}")];
        let err = LocalEngine::new(3)
            .parse_all(shards, &FieldNames::default(), ParseMode::Strict)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("malformed record at part-1:1"), "{err}");
    }

    #[tokio::test]
    async fn test_sort_groups_keys_in_time_order() {
        let contents = [
            r#"{"timestamp": 3, "website": "b", "users": 1}"#,
            r#"{"timestamp": 2, "website": "a", "users": 1}"#,
            r#"{"timestamp": 1, "website": "b", "users": 1}"#,
            r#"{"timestamp": 1, "website": "a", "users": 1}"#,
        ]
        .join("\n");
        let engine = LocalEngine::new(2);
        let parsed = engine
            .parse_all(vec![shard(0, &contents)], &FieldNames::default(), ParseMode::Strict)
            .await
            .unwrap();
        let sorted = engine.sort_by_key_then_order(parsed.records).await.unwrap();
        let lines: Vec<(&str, usize)> = sorted
            .iter()
            .map(|r| (r.key(), r.order().ingest().line()))
            .collect();
        assert_eq!(lines, vec![("a", 3), ("a", 1), ("b", 2), ("b", 0)]);
    }

    #[tokio::test]
    async fn test_write_all_is_atomic_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results");
        let engine = LocalEngine::new(2);
        let written = engine
            .write_all(
                &out,
                vec![verdict("a", true), verdict("b", false), verdict("c", true)],
                &FieldNames::default(),
            )
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert!(out.join(SUCCESS_MARKER).exists());
        assert_eq!(
            fs::read_to_string(out.join("part-00000")).unwrap(),
            "{\"website\":\"a\",\"monotonic\":true}\n{\"website\":\"b\",\"monotonic\":false}\n"
        );
        assert_eq!(
            fs::read_to_string(out.join("part-00001")).unwrap(),
            "{\"website\":\"c\",\"monotonic\":true}\n"
        );

        let again = engine
            .write_all(&out, vec![verdict("a", true)], &FieldNames::default())
            .await;
        assert!(matches!(again, Err(EngineError::OutputExists(_))));

        // No staging directories are left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".monotone-staging-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_write_all_empty_results() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("results");
        let written = LocalEngine::new(4)
            .write_all(&out, Vec::new(), &FieldNames::default())
            .await
            .unwrap();
        assert_eq!(written, 0);
        let names: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![SUCCESS_MARKER.to_string()]);
    }
}
