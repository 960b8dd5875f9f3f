//! Image domain — registry pulls and in-engine builds from a tar context.

use bollard::query_parameters::{BuildImageOptionsBuilder, CreateImageOptionsBuilder};
use futures::StreamExt;
use tracing::{debug, warn};

use super::{DockerDriver, DockerError};

/// Folds the engine's build event stream into a verdict.
///
/// The stream is JSON lines; the engine signals success only through a
/// `"Successfully built"` stream line. An `error`/`errorDetail` event is a
/// failure with that message, and a stream that ends without the success
/// marker failed even if no error event was seen. A missing
/// `"Successfully tagged"` line is merely suspicious.
#[derive(Debug, Default)]
pub struct BuildProgress {
    built: bool,
    tagged: bool,
    error: Option<String>,
}

impl BuildProgress {
    pub fn observe(
        &mut self,
        stream: Option<&str>,
        error: Option<&str>,
        error_detail: Option<&str>,
    ) {
        if let Some(line) = stream {
            if line.contains("Successfully built") {
                self.built = true;
            }
            if line.contains("Successfully tagged") {
                self.tagged = true;
            }
        }

        if self.error.is_none() {
            if let Some(message) = error_detail.or(error) {
                self.error = Some(message.to_string());
            }
        }
    }

    /// Verdict at stream end. `Ok(tagged)` on success.
    pub fn finish(self) -> Result<bool, String> {
        if let Some(message) = self.error {
            return Err(message);
        }
        if !self.built {
            return Err("build stream ended without success marker".to_string());
        }

        Ok(self.tagged)
    }
}

impl DockerDriver {
    pub(super) async fn pull_image_inner(
        &self,
        image: &str,
        tag: &str,
    ) -> Result<(), DockerError> {
        let options = CreateImageOptionsBuilder::default()
            .from_image(image)
            .tag(tag)
            .build();

        let mut stream = self.client().create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            let info = result?;
            debug!(image, tag, status = ?info.status, "image pull progress");
        }

        Ok(())
    }

    pub(super) async fn build_image_inner(
        &self,
        context: Vec<u8>,
        tag: &str,
    ) -> Result<(), DockerError> {
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .build();

        let mut stream = self.client().build_image(
            options,
            None,
            Some(bollard::body_full(bytes::Bytes::from(context))),
        );

        let mut progress = BuildProgress::default();
        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(line) = info.stream.as_deref() {
                debug!(tag, line = line.trim_end(), "build output");
            }
            progress.observe(
                info.stream.as_deref(),
                None,
                info.error_detail
                    .as_ref()
                    .and_then(|detail| detail.message.as_deref()),
            );
        }

        match progress.finish() {
            Ok(tagged) => {
                if !tagged {
                    warn!(tag, "build succeeded but tag confirmation never arrived");
                }
                Ok(())
            }
            Err(message) => Err(DockerError::Build(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_stream_with_tag() {
        let mut progress = BuildProgress::default();
        progress.observe(Some("Step 1/7 : FROM node:20-alpine\n"), None, None);
        progress.observe(Some("Successfully built 4b825dc642cb\n"), None, None);
        progress.observe(Some("Successfully tagged img_demo_1700000000:main\n"), None, None);

        assert_eq!(progress.finish(), Ok(true));
    }

    #[test]
    fn missing_tag_line_is_only_a_warning() {
        let mut progress = BuildProgress::default();
        progress.observe(Some("Successfully built 4b825dc642cb\n"), None, None);

        assert_eq!(progress.finish(), Ok(false));
    }

    #[test]
    fn error_event_wins_with_its_message() {
        let mut progress = BuildProgress::default();
        progress.observe(Some("Step 3/7 : RUN git clone ...\n"), None, None);
        progress.observe(
            None,
            Some("The command '/bin/sh -c git clone' returned a non-zero code: 128"),
            Some("repository 'https://example.invalid/app.git/' not found"),
        );

        let err = progress.finish().unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn stream_end_without_marker_is_a_failure() {
        let mut progress = BuildProgress::default();
        progress.observe(Some("Step 1/7 : FROM node:20-alpine\n"), None, None);

        assert!(progress.finish().is_err());
    }
}
