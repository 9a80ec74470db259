//! Conversion of rendered documents into PDF by an external utility.
//!
//! Every call gets its own temporary workspace holding the input file and an
//! output directory, so concurrent conversions never share filenames. The
//! child process is killed when the timeout elapses, and the workspace is
//! removed when the call returns on every path.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::render::Escaping;

const INPUT_STEM: &str = "document";

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to create temporary directory: {0}")]
    TempDir(#[source] std::io::Error),
    #[error("failed to write converter input: {0}")]
    WriteInput(#[source] std::io::Error),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with status {code}: {stderr}")]
    Exit {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("{program} produced no output file")]
    MissingOutput { program: String },
    #[error("failed to read converted document: {0}")]
    ReadOutput(#[source] std::io::Error),
}

/// Turns a rendered editable document into its distribution format.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Extension of the editable documents this converter accepts.
    fn source_extension(&self) -> &str;

    /// Extension of the documents it produces.
    fn output_extension(&self) -> &str;

    /// Escaping the renderer must apply for this source format.
    fn escaping(&self) -> Escaping;

    async fn convert(&self, source: &[u8]) -> Result<Vec<u8>, ConversionError>;
}

/// Runs a command-line converter.
///
/// Arguments may contain `{input}`, `{output}`, `{outdir}` and `{workdir}`,
/// which are replaced with paths inside the per-call workspace.
#[derive(Debug, Clone)]
pub struct ProcessConverter {
    program: String,
    args: Vec<String>,
    source_extension: String,
    output_extension: String,
    escaping: Escaping,
    timeout: Duration,
}

impl ProcessConverter {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        source_extension: impl Into<String>,
        output_extension: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            source_extension: source_extension.into(),
            output_extension: output_extension.into(),
            escaping: Escaping::None,
            timeout,
        }
    }

    /// `typst compile` over Typst source templates.
    pub fn typst(timeout: Duration) -> Self {
        Self::new(
            "typst",
            vec!["compile".into(), "{input}".into(), "{output}".into()],
            "typ",
            "pdf",
            timeout,
        )
        .with_escaping(Escaping::TypstString)
    }

    /// Headless LibreOffice over flat ODF (`.fodt`) templates. The user
    /// profile lives in the workspace so parallel instances do not lock
    /// each other out.
    pub fn libreoffice(timeout: Duration) -> Self {
        Self::new(
            "soffice",
            vec![
                "-env:UserInstallation=file://{workdir}/profile".into(),
                "--headless".into(),
                "--convert-to".into(),
                "pdf".into(),
                "--outdir".into(),
                "{outdir}".into(),
                "{input}".into(),
            ],
            "fodt",
            "pdf",
            timeout,
        )
        .with_escaping(Escaping::Xml)
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_escaping(mut self, escaping: Escaping) -> Self {
        self.escaping = escaping;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn expand_args(&self, workdir: &Path, input: &Path, outdir: &Path, output: &Path) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{outdir}", &outdir.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{workdir}", &workdir.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl Converter for ProcessConverter {
    fn source_extension(&self) -> &str {
        &self.source_extension
    }

    fn output_extension(&self) -> &str {
        &self.output_extension
    }

    fn escaping(&self) -> Escaping {
        self.escaping
    }

    async fn convert(&self, source: &[u8]) -> Result<Vec<u8>, ConversionError> {
        let workspace = tempfile::tempdir().map_err(ConversionError::TempDir)?;
        let workdir = workspace.path();
        let input = workdir.join(format!("{}.{}", INPUT_STEM, self.source_extension));
        let outdir = workdir.join("out");
        let output = outdir.join(format!("{}.{}", INPUT_STEM, self.output_extension));

        tokio::fs::create_dir_all(&outdir)
            .await
            .map_err(ConversionError::WriteInput)?;
        tokio::fs::write(&input, source)
            .await
            .map_err(ConversionError::WriteInput)?;

        let args = self.expand_args(workdir, &input, &outdir, &output);
        log::debug!("Running converter: {} {}", self.program, args.join(" "));

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let finished = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(finished)) => finished,
            Ok(Err(source)) => {
                return Err(ConversionError::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConversionError::Timeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                })
            }
        };

        if !finished.status.success() {
            let stderr = String::from_utf8_lossy(&finished.stderr).trim().to_string();
            return Err(ConversionError::Exit {
                program: self.program.clone(),
                code: finished.status.code().unwrap_or(-1),
                stderr,
            });
        }

        match tokio::fs::read(&output).await {
            Ok(bytes) if !bytes.is_empty() => Ok(bytes),
            Ok(_) => Err(ConversionError::MissingOutput {
                program: self.program.clone(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ConversionError::MissingOutput {
                program: self.program.clone(),
            }),
            Err(e) => Err(ConversionError::ReadOutput(e)),
        }
    }
}
