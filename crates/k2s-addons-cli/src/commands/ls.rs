use super::{json_pretty, Context, EXIT_SUCCESS};
use console::Style;
use k2s_addons_core::CoreError;
use k2s_addons_schema::ManifestRepository;

pub fn run(ctx: &Context, json: bool) -> Result<u8, String> {
    let catalog = ManifestRepository::new(&ctx.install_dir)
        .load()
        .map_err(|e| CoreError::from(e).to_string())?;

    if json {
        let addons: Vec<_> = catalog
            .addons()
            .iter()
            .map(|addon| {
                let implementations: Vec<_> = addon
                    .implementations()
                    .iter()
                    .map(|i| {
                        serde_json::json!({
                            "name": i.name,
                            "description": i.description,
                            "command": i.addons_cmd_name,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "name": addon.name(),
                    "description": addon.metadata.description,
                    "directory": catalog.relative_directory(addon),
                    "implementations": implementations,
                })
            })
            .collect();
        println!("{}", json_pretty(&addons)?);
    } else if catalog.is_empty() {
        println!("no addons found in {}", catalog.addons_root().display());
    } else {
        let bold = Style::new().bold();
        for addon in catalog.addons() {
            println!("{:<24} {}", bold.apply_to(addon.name()), addon.metadata.description);
            for implementation in addon.implementations() {
                if implementation.name == addon.name() {
                    continue;
                }
                println!(
                    "  {:<22} {}",
                    implementation.name, implementation.description
                );
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
