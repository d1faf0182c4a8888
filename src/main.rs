use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use snafu::{prelude::*, Report};
use tracing::{error, info};

use mammoscreen::{archive, extract, plot, results, upload};

const TERMS_LINK: &str = "https://eval.mammoscreen.io/terms";

#[derive(Parser, Debug)]
#[command(
    name = "mammoscreen",
    version,
    about = "Evaluation of AI algorithms for cancer detection in mammography",
    after_help = "Example of use: mammoscreen --input /my/local/dicom_data \
                  --output /my/local/output/folder --access_key XXX"
)]
struct Cli {
    /// Path to a DICOM file, a study directory containing DICOM files,
    /// or a directory of study directories
    #[arg(long = "input")]
    input: PathBuf,

    /// Output directory to store results
    #[arg(long = "output")]
    output: PathBuf,

    /// Access key provided by the authors
    #[arg(long = "access_key")]
    access_key: String,

    /// Directory to store pre-processed files (optional)
    #[arg(long = "preprocess_dir")]
    preprocess_dir: Option<PathBuf>,

    /// Results url for a previous request (used to display the results
    /// asynchronously)
    #[arg(long = "results_url")]
    results_url: Option<String>,

    /// Generate images/bounding boxes (y/n)
    #[arg(long = "plot_images", value_parser = ["y", "n"])]
    plot_images: Option<String>,

    /// Evaluation service endpoint
    #[arg(long = "server", default_value = upload::DEFAULT_SERVER)]
    server: String,

    /// Verbose mode
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Snafu)]
enum Error {
    /// Path {path} does not exist
    MissingInput { path: String },

    /// Could not create output directory {path}
    CreateOutput {
        path: String,
        source: std::io::Error,
    },

    /// Failed while reading input files
    Extract { source: extract::Error },

    /// Failed while packaging files for upload
    Package { source: archive::Error },

    /// Failed while communicating with the evaluation service
    Submit { source: upload::Error },

    /// Failed while processing the returned results
    PostProcess { source: results::Error },

    /// You must agree to the Terms of Service to proceed
    TermsDeclined,
}

fn init_logging(verbose: bool) {
    // Use RUST_LOG env var if set, otherwise use the verbose flag
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish(),
    );
}

fn read_answer(prompt: &str) -> String {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    line.trim().to_lowercase()
}

/// The upload ships medical images off the machine, so it is gated on an
/// explicit agreement. Declining (or exhausting the attempts) aborts the
/// run before any network traffic.
fn confirm_terms() -> bool {
    println!("Files are ready to send. Please confirm the following statement to proceed:");
    println!(
        "I agree with the Terms of Service {TERMS_LINK} and certify that the \
         images transferred do not include protected health information."
    );
    for _ in 0..5 {
        match read_answer("Confirm (y/n)? ").as_str() {
            "y" => return true,
            "n" => return false,
            _ => {}
        }
    }
    false
}

fn ask_yes_no(prompt: &str) -> bool {
    loop {
        match read_answer(prompt).as_str() {
            "y" => return true,
            "n" => return false,
            _ => {}
        }
    }
}

fn cleanup_temp(preprocess_dir: &Path, keep_preprocessed: bool, zip_path: Option<&Path>) {
    info!("Cleaning temp files...");
    if let Some(zip_path) = zip_path {
        let _ = std::fs::remove_file(zip_path);
    }
    if !keep_preprocessed {
        let _ = std::fs::remove_dir_all(preprocess_dir);
    }
}

/// Extract, package and upload the input; returns the upload session.
async fn submit_input(
    cli: &Cli,
    client: &reqwest::Client,
    input: &Path,
) -> Result<Option<upload::Session>, Error> {
    let (preprocess_dir, keep_preprocessed) = match &cli.preprocess_dir {
        Some(dir) => {
            extract::prepare_preprocess_dir(dir).context(ExtractSnafu)?;
            (dir.clone(), true)
        }
        None => {
            let dir = std::env::temp_dir().join(format!(
                "preprocessed_{}",
                uuid::Uuid::new_v4().simple()
            ));
            extract::prepare_preprocess_dir(&dir).context(ExtractSnafu)?;
            (dir, false)
        }
    };

    info!("Reading files...");
    let summary = match extract::extract_input(input, &preprocess_dir) {
        Ok(summary) => summary,
        Err(e) => {
            cleanup_temp(&preprocess_dir, keep_preprocessed, None);
            return Err(e).context(ExtractSnafu);
        }
    };
    if summary.num_images() == 0 {
        info!("No valid files were found in input '{}'", input.display());
        cleanup_temp(&preprocess_dir, keep_preprocessed, None);
        return Ok(None);
    }
    info!(
        "Extracted {} image(s) from {} study(ies), {} rejected",
        summary.num_images(),
        summary.studies.len(),
        summary.rejected
    );

    if let Err(e) = upload::check_quota(summary.studies.len(), summary.num_images()) {
        cleanup_temp(&preprocess_dir, keep_preprocessed, None);
        return Err(e).context(SubmitSnafu);
    }

    info!("Preparing files for sending...");
    let study_labels = summary
        .studies
        .iter()
        .map(|s| (s.study_hash.clone(), s.source.display().to_string()))
        .collect();
    let (zip_path, _manifest) = match archive::pack_for_upload(&preprocess_dir, &study_labels) {
        Ok(packed) => packed,
        Err(e) => {
            cleanup_temp(&preprocess_dir, keep_preprocessed, None);
            return Err(e).context(PackageSnafu);
        }
    };

    if !confirm_terms() {
        cleanup_temp(&preprocess_dir, keep_preprocessed, Some(&zip_path));
        return TermsDeclinedSnafu.fail();
    }

    info!(
        "Sending files to the server (temp file at {})...",
        zip_path.display()
    );
    let sent = upload::send_archive(client, &cli.server, &zip_path, &cli.access_key).await;
    cleanup_temp(&preprocess_dir, keep_preprocessed, Some(&zip_path));
    let session = sent.context(SubmitSnafu)?;

    println!(
        "The results are being generated.\n\
         You can stop this process now with Ctrl+C or wait for the results.\n\
         If you stop the process, you can display the results later by passing \
         this url as the 'results_url' parameter:\n{}",
        session.results_url
    );
    Ok(Some(session))
}

async fn run(cli: Cli) -> Result<(), Error> {
    let input = cli.input.canonicalize().map_err(|_| Error::MissingInput {
        path: cli.input.display().to_string(),
    })?;
    std::fs::create_dir_all(&cli.output).context(CreateOutputSnafu {
        path: cli.output.display().to_string(),
    })?;
    let client = reqwest::Client::new();

    let (session_id, results_url) = match &cli.results_url {
        None => match submit_input(&cli, &client, &input).await? {
            Some(session) => (session.session_id, session.results_url),
            // Nothing to upload
            None => return Ok(()),
        },
        Some(url) => (upload::session_id_from_url(url), url.clone()),
    };

    let results_zip = cli.output.join(format!("{}.zip", session_id));
    info!("Waiting for results to be ready at {}...", results_url);
    let downloaded = upload::poll_results(&client, &results_url, &results_zip)
        .await
        .context(SubmitSnafu)?;
    info!("Results downloaded to {}", downloaded.display());

    let (study_rows, file_rows) =
        results::process_results(&downloaded, &cli.output, &session_id, &input)
            .context(PostProcessSnafu)?;
    info!("{} study score(s) available", study_rows.len());

    if !file_rows.is_empty() {
        let plot_images = match cli.plot_images.as_deref() {
            Some("y") => true,
            Some("n") => false,
            _ => ask_yes_no("Do you want to generate images for the results? (y/n) "),
        };
        if plot_images {
            let written = plot::plot_results(&file_rows, &cli.output.join(&session_id));
            info!("Images generated ({} file(s))", written);
        }
    }

    info!(
        "All the result files have been saved to {}",
        cli.output.join(&session_id).display()
    );
    let _ = std::fs::remove_file(&downloaded);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli).await {
        error!("{}", Report::from_error(e));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_required_flags() {
        let cli = Cli::try_parse_from([
            "mammoscreen",
            "--input",
            "/data/dicoms",
            "--output",
            "/data/out",
            "--access_key",
            "XXX",
        ])
        .unwrap();
        assert_eq!(cli.input, PathBuf::from("/data/dicoms"));
        assert_eq!(cli.access_key, "XXX");
        assert_eq!(cli.server, upload::DEFAULT_SERVER);
        assert!(cli.results_url.is_none());
        assert!(cli.plot_images.is_none());
    }

    #[test]
    fn test_cli_rejects_bad_plot_choice() {
        let result = Cli::try_parse_from([
            "mammoscreen",
            "--input",
            "a",
            "--output",
            "b",
            "--access_key",
            "c",
            "--plot_images",
            "maybe",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_missing_access_key_is_an_error() {
        let result = Cli::try_parse_from(["mammoscreen", "--input", "a", "--output", "b"]);
        assert!(result.is_err());
    }
}
