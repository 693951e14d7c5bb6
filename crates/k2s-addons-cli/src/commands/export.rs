use super::{json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_SUCCESS};
use k2s_addons_core::{ArtifactBuilder, Cancellation, CoreError, ExportScope};
use k2s_addons_schema::ManifestRepository;
use std::path::Path;

pub fn run(
    ctx: Context,
    addon: Option<&str>,
    implementation: Option<&str>,
    dir: &Path,
    json: bool,
) -> Result<u8, String> {
    let catalog = ManifestRepository::new(&ctx.install_dir)
        .load()
        .map_err(|e| CoreError::from(e).to_string())?;
    let scope = ExportScope::from_args(addon, implementation);
    let node = ctx.node();
    let cache = ctx.config.packages_cache_dir(&ctx.install_dir);
    let builder = ArtifactBuilder::new(catalog, node, ctx.config)
        .with_package_cache(cache)
        .with_cancellation(Cancellation::from_signal());

    let pb = (!json).then(|| spinner(&format!("exporting {}...", scope.label())));
    let result = match builder.export(&scope, dir) {
        Ok(result) => result,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "export failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        let payload = serde_json::json!({
            "artifact": result.artifact,
            "implementations": result.index.manifests.len(),
            "blobs": result.blob_count,
            "addons": result.metadata.addons,
        });
        println!("{}", json_pretty(&payload)?);
    } else if let Some(pb) = &pb {
        spin_ok(
            pb,
            &format!(
                "exported {} implementation(s) to {}",
                result.index.manifests.len(),
                result.artifact.display()
            ),
        );
    }
    Ok(EXIT_SUCCESS)
}
