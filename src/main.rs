//! CLI entry point for the courier tool.

use std::io::{self, IsTerminal, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use courier_core::{
    BytesProcessor, DownloadedFile, EngineBinding, EngineConfig, JsonProcessor, Processor,
    ProgressListener, Request, RequestEngine, ResultContainer,
};
use futures_util::future::join_all;
use indicatif::MultiProgress;
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::Args;
use progress::{BarProgress, download_path, multi_progress};

/// Registry id used for every request the CLI makes.
const CLI_PROCESSOR_ID: i32 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = args
        .engine_config()
        .context("invalid engine configuration")?;

    let urls = read_urls(&args.urls)?;
    if urls.is_empty() {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/data.json' | courier --json");
        return Ok(());
    }

    if let Some(dir) = &args.download {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create download directory {}", dir.display()))?;
    }

    let binding = Arc::new(EngineBinding::from_config(&config));
    binding.connecting();
    let engine = RequestEngine::open(config.clone())
        .await
        .context("failed to start request engine")?;
    binding.on_connected(engine.clone());

    let processor: Arc<dyn Processor> = if args.json {
        Arc::new(JsonProcessor::<serde_json::Value>::new(CLI_PROCESSOR_ID))
    } else {
        Arc::new(BytesProcessor::new(CLI_PROCESSOR_ID))
    };
    let multi = multi_progress(args.download.is_some() && !args.quiet);

    let total = urls.len();
    let runs = urls.iter().enumerate().map(|(index, url)| {
        fetch_one(
            &binding,
            &config,
            Arc::clone(&processor),
            &multi,
            args.download.as_deref(),
            url,
            index,
            total,
        )
    });
    let outcomes = join_all(runs).await;

    let mut failed = 0usize;
    let mut stdout = io::stdout().lock();
    for (url, outcome) in urls.iter().zip(outcomes) {
        match outcome {
            Ok(container) if container.successful => {
                report_success(&mut stdout, url, &container, args.json)?;
            }
            Ok(container) => {
                failed += 1;
                let reason = container
                    .error
                    .as_ref()
                    .map_or_else(|| "no payload".to_string(), ToString::to_string);
                warn!(url = %url, status = ?container.status, error = %reason, "request failed");
            }
            Err(error) => {
                failed += 1;
                warn!(url = %url, error = %error, "request rejected");
            }
        }
    }
    stdout.flush()?;

    let stats = engine.stats();
    info!(
        completed = stats.completed(),
        failed = stats.failed(),
        from_cache = stats.served_from_cache(),
        "Run complete"
    );
    binding.safe_disconnect();

    if failed > 0 {
        bail!("{failed} of {total} requests failed");
    }
    Ok(())
}

/// Positional URLs, or one URL per stdin line when none were given.
fn read_urls(positional: &[String]) -> Result<Vec<String>> {
    let raw = if !positional.is_empty() {
        positional.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        String::new()
    };
    Ok(parse_url_lines(&raw))
}

fn parse_url_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn fetch_one(
    binding: &EngineBinding,
    config: &EngineConfig,
    processor: Arc<dyn Processor>,
    multi: &MultiProgress,
    download_dir: Option<&Path>,
    url: &str,
    index: usize,
    total: usize,
) -> Result<ResultContainer> {
    let mut builder = Request::builder_with(url, config).processor(CLI_PROCESSOR_ID);
    let mut bar = None;
    if let Some(dir) = download_dir {
        let path = download_path(dir, url, index, total);
        let label = path
            .file_name()
            .map_or_else(|| url.to_string(), |name| name.to_string_lossy().into_owned());
        bar = Some(Arc::new(BarProgress::new(multi, &label)));
        builder = builder.download_to(path, None);
    }
    let request = builder
        .build()
        .with_context(|| format!("invalid request for {url}"))?;

    let listener = bar.clone().map(|bar| bar as Arc<dyn ProgressListener>);
    let result = binding.run_sync_with(request, processor, listener).await;
    if let Some(bar) = bar {
        bar.finish();
    }
    Ok(result?)
}

fn report_success(
    out: &mut impl Write,
    url: &str,
    container: &ResultContainer,
    json: bool,
) -> Result<()> {
    let provenance = container
        .provenance
        .map_or_else(|| "network".to_string(), |p| format!("{p:?}").to_lowercase());

    if let Some(file) = container.payload_as::<DownloadedFile>() {
        info!(url = %url, bytes = file.bytes, source = %provenance, "downloaded");
        writeln!(out, "{}\t{}\t{}", file.path.display(), file.bytes, file.sha256)?;
    } else if json {
        let value = container
            .payload_as::<serde_json::Value>()
            .context("JSON payload missing")?;
        info!(url = %url, status = ?container.status, source = %provenance, "fetched");
        writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    } else {
        let body = container
            .payload_as::<Bytes>()
            .context("byte payload missing")?;
        info!(url = %url, status = ?container.status, bytes = body.len(), source = %provenance, "fetched");
        out.write_all(body)?;
        if !body.ends_with(b"\n") {
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_lines_skips_blanks_and_comments() {
        let urls = parse_url_lines("https://a.example/\n\n  # note\n  https://b.example/x  \n");
        assert_eq!(urls, vec!["https://a.example/", "https://b.example/x"]);
    }

    #[test]
    fn test_report_success_writes_bytes_with_newline() {
        let container = ResultContainer {
            successful: true,
            payload: Some(Arc::new(Bytes::from_static(b"hello"))),
            ..ResultContainer::default()
        };
        let mut out = Vec::new();
        report_success(&mut out, "https://example.com", &container, false).unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn test_report_success_writes_download_line() {
        let container = ResultContainer {
            successful: true,
            payload: Some(Arc::new(DownloadedFile {
                path: "/tmp/out/x.bin".into(),
                bytes: 3,
                sha256: "abc".to_string(),
            })),
            ..ResultContainer::default()
        };
        let mut out = Vec::new();
        report_success(&mut out, "https://example.com/x.bin", &container, false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "/tmp/out/x.bin\t3\tabc\n");
    }

    #[test]
    fn test_report_success_pretty_prints_json() {
        let container = ResultContainer {
            successful: true,
            payload: Some(Arc::new(serde_json::json!({"ok": true}))),
            ..ResultContainer::default()
        };
        let mut out = Vec::new();
        report_success(&mut out, "https://example.com", &container, true).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("\"ok\": true"));
    }
}
