/// Run one provisioning stage.
///
/// The body runs inside an `info_span!("stage")` carrying the stage name, and must
/// evaluate to `Result<T, ProvisionError>`; `?` works inside it. Failures come out
/// tagged as a [`crate::error::BuildError`]. A pending interrupt fails the stage
/// before the body starts.
///
/// # Examples
/// ```rs
/// stage!(host, Stage::Format => {
///     format::format_efi(host, &esp, &cfg.image.efi_label)
/// })?;
/// ```
#[macro_export]
macro_rules! stage {
    ($host:expr, $stage:expr => $body:block) => {{
        let stage: $crate::build::Stage = $stage;
        let span = tracing::info_span!("stage", name = %stage);
        let _guard = span.enter();

        #[allow(clippy::redundant_closure_call)]
        let result = if $host.interrupted() {
            tracing::warn!("Interrupted, skipping stage");
            Err($crate::error::ProvisionError::Interrupted)
        } else {
            tracing::debug!("Entering stage");
            (|| -> Result<_, $crate::error::ProvisionError> { $body })()
        };

        match &result {
            Ok(_) => tracing::debug!("Stage finished"),
            Err(e) => tracing::error!("{e}"),
        }
        result.map_err(|source| $crate::error::BuildError { stage, source })
    }};
}
