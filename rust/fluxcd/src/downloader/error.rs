use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
#[snafu(visibility(pub(crate)))]
pub enum FetcherError {
    #[snafu(display("Url parse error: {}", source))]
    InvalidParseUrl { source: url::ParseError },

    #[snafu(display("Cannot create scratch directory: {}", source))]
    CannotCreateScratchDir { source: std::io::Error },

    #[snafu(display("Cannot unpack archive: {}", source))]
    CannotUnpack { source: std::io::Error },

    #[snafu(display("Cannot download: {}", source))]
    CannotDownload { source: reqwest_middleware::Error },

    #[snafu(display("Artifact not found at {}: {}", url, source))]
    ArtifactNotFound { url: String, source: reqwest::Error },

    #[snafu(display("Cannot get body: {}", source))]
    CannotGetBody { source: reqwest::Error },

    #[snafu(display(
        "Checksum mismatch for {}: expected {}, got sha256:{}",
        url,
        expected,
        actual
    ))]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
}
