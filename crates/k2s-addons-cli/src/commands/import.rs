use super::{json_pretty, spin_fail, spin_ok, spinner, Context, EXIT_FAILURE, EXIT_SUCCESS};
use k2s_addons_core::{ArtifactImporter, Cancellation};
use std::path::Path;

pub fn run(ctx: &Context, names: &[String], zip: &Path, json: bool) -> Result<u8, String> {
    let node = ctx.node();
    let importer = ArtifactImporter::new(&ctx.install_dir, node.clone(), node)
        .with_cancellation(Cancellation::from_signal());

    let pb = (!json).then(|| spinner(&format!("importing {}...", zip.display())));
    let report = match importer.import(zip, names) {
        Ok(report) => report,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "import failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!("{}", json_pretty(&report)?);
    } else if let Some(pb) = &pb {
        let summary = format!(
            "imported {} implementation(s), {} failed",
            report.imported.len(),
            report.failed.len()
        );
        if report.is_success() {
            spin_ok(pb, &summary);
        } else {
            spin_fail(pb, &summary);
        }
        for item in &report.imported {
            println!(
                "  {} {} -> {}",
                item.addon,
                item.implementation,
                item.directory.display()
            );
        }
        for item in &report.failed {
            println!("  {} {}: {}", item.addon, item.implementation, item.error);
        }
        if !report.skipped.is_empty() {
            println!("  skipped {} implementation(s) not selected", report.skipped.len());
        }
        if report.cancelled {
            println!("  cancelled before all implementations were imported");
        }
    }

    Ok(if report.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
