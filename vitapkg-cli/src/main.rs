//! vitapkg CLI - download and stage PlayStation Vita packages.
//!
//! This binary drives the library's streaming pipeline from the command
//! line. It downloads a PKG into a staging directory, decrypting and
//! verifying on the fly; placement into a real console filesystem is the
//! host's business.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vitapkg::{ContentId, Download, DownloadOutcome, DownloadRequest, ReqwestSource, StdFilesystem};

#[derive(Parser)]
#[command(name = "vitapkg")]
#[command(about = "Download and decrypt a PlayStation Vita PKG", long_about = None)]
struct Args {
    /// 36-character PSN content id, e.g. EP0000-PCSE00000_00-0000000000000000
    #[arg(long)]
    content_id: String,

    /// Resumable HTTP(S) URL of the package
    #[arg(long)]
    url: String,

    /// Staging directory; the package lands in <dir>/<content-id>
    #[arg(long, default_value = "pkgj")]
    output: PathBuf,

    /// File containing the 512-byte RIF license blob
    #[arg(long)]
    rif: Option<PathBuf>,

    /// Expected SHA-256 of the whole package, as 64 hex digits
    #[arg(long)]
    sha256: Option<String>,
}

fn parse_digest(hex: &str) -> Result<[u8; 32], String> {
    if hex.len() != 64 {
        return Err(format!("expected 64 hex digits, got {}", hex.len()));
    }
    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| format!("bad hex at position {}", i * 2))?;
    }
    Ok(digest)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Err(e) = ContentId::parse(&args.content_id) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    let digest = match args.sha256.as_deref().map(parse_digest) {
        Some(Ok(digest)) => Some(digest),
        Some(Err(e)) => {
            eprintln!("Error: invalid --sha256: {e}");
            process::exit(1);
        }
        None => None,
    };

    let rif = match args.rif.as_deref().map(std::fs::read) {
        Some(Ok(rif)) => Some(rif),
        Some(Err(e)) => {
            eprintln!("Error: cannot read RIF file: {e}");
            process::exit(1);
        }
        None => None,
    };

    let http = match ReqwestSource::new() {
        Ok(http) => http,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let download = Download::new(
        Box::new(http),
        Box::new(StdFilesystem::new()),
        args.output,
        DownloadRequest {
            content_id: args.content_id,
            url: args.url,
            rif,
            digest,
        },
    );
    let download = match download {
        Ok(download) => download,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let mut download = download.with_progress(Box::new(|snapshot| {
        if snapshot.total_bytes > 0 {
            let percent = snapshot.bytes_downloaded as f64 / snapshot.total_bytes as f64 * 100.0;
            println!(
                "{:5.1}%  {:>12} / {} bytes  {}",
                percent, snapshot.bytes_downloaded, snapshot.total_bytes, snapshot.item_name
            );
        }
    }));

    match download.run() {
        Ok(DownloadOutcome::Completed) => {
            println!("Staged into {}", download.root().display());
        }
        Ok(DownloadOutcome::Cancelled) => {
            println!(
                "Cancelled at byte {}; rerun to resume",
                download.download_offset()
            );
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
