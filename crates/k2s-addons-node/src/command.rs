use crate::backend::{
    archive_file_name, ImageArchiver, ImageLoader, NodeOs, PackageInstaller, PackageSet,
};
use crate::NodeError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Command templates, split on whitespace and run without a shell.
///
/// Placeholders: `{image}`, `{archive}`, `{os}` for save/load; `{dir}` and
/// `{os}` for package installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCommands {
    pub image_save: Option<String>,
    pub image_load: Option<String>,
    pub package_install: Option<String>,
}

/// Runs node-side work through external commands.
///
/// An unset template turns the matching step into a logged no-op, so an
/// artifact can still be built or imported with image references only.
pub struct CommandNode {
    commands: NodeCommands,
}

impl CommandNode {
    pub fn new(commands: NodeCommands) -> Self {
        Self { commands }
    }
}

fn render(template: &str, vars: &[(&str, &str)]) -> Result<Vec<String>, NodeError> {
    let args: Vec<String> = template
        .split_whitespace()
        .map(|token| {
            vars.iter().fold(token.to_owned(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect();
    if args.is_empty() {
        return Err(NodeError::InvalidTemplate(template.to_owned()));
    }
    Ok(args)
}

fn run(args: &[String]) -> Result<(), NodeError> {
    let command = args.join(" ");
    debug!("running: {command}");
    let output = Command::new(&args[0]).args(&args[1..]).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(NodeError::CommandFailed {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

impl ImageArchiver for CommandNode {
    fn name(&self) -> &str {
        "command"
    }

    fn save(
        &self,
        os: NodeOs,
        images: &[String],
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, NodeError> {
        let Some(template) = &self.commands.image_save else {
            if !images.is_empty() {
                warn!(
                    "no image save command configured; exporting {} {os} image reference(s) without archives",
                    images.len()
                );
            }
            return Ok(Vec::new());
        };

        let mut written = Vec::with_capacity(images.len());
        for image in images {
            let archive = dest_dir.join(archive_file_name(image));
            let archive_str = archive.to_string_lossy();
            run(&render(
                template,
                &[("image", image), ("archive", &archive_str), ("os", os.as_str())],
            )?)?;
            info!("saved {os} image {image}");
            written.push(archive);
        }
        Ok(written)
    }
}

impl ImageLoader for CommandNode {
    fn name(&self) -> &str {
        "command"
    }

    fn load(&self, os: NodeOs, images: &[String], archive_dir: &Path) -> Result<(), NodeError> {
        if images.is_empty() {
            return Ok(());
        }
        let Some(template) = &self.commands.image_load else {
            return Err(NodeError::NotConfigured("image load"));
        };

        for image in images {
            let archive = archive_dir.join(archive_file_name(image));
            if !archive.is_file() {
                return Err(NodeError::MissingArchive {
                    image: image.clone(),
                    path: archive,
                });
            }
            let archive_str = archive.to_string_lossy();
            run(&render(
                template,
                &[("image", image), ("archive", &archive_str), ("os", os.as_str())],
            )?)?;
            info!("loaded {os} image {image}");
        }
        Ok(())
    }
}

impl PackageInstaller for CommandNode {
    fn name(&self) -> &str {
        "command"
    }

    fn install(&self, packages: &PackageSet, source_dir: &Path) -> Result<(), NodeError> {
        if !packages.has_linux_packages() {
            return Ok(());
        }
        let Some(template) = &self.commands.package_install else {
            return Err(NodeError::NotConfigured("package install"));
        };
        let dir = source_dir.to_string_lossy();
        run(&render(template, &[("dir", &dir), ("os", NodeOs::Linux.as_str())])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_placeholders_per_argument() {
        let args = render(
            "nerdctl save -o {archive} {image}",
            &[("image", "a.io/b:c"), ("archive", "/tmp/a.tar")],
        )
        .unwrap();
        assert_eq!(args, vec!["nerdctl", "save", "-o", "/tmp/a.tar", "a.io/b:c"]);
    }

    #[test]
    fn render_rejects_blank_template() {
        assert!(matches!(
            render("   ", &[]),
            Err(NodeError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn unset_save_template_exports_references_only() {
        let dir = tempfile::tempdir().unwrap();
        let node = CommandNode::new(NodeCommands::default());
        let written = node
            .save(NodeOs::Linux, &["a.io/b:c".to_owned()], dir.path())
            .unwrap();
        assert!(written.is_empty());
    }

    #[test]
    fn unset_load_template_fails_when_images_are_present() {
        let dir = tempfile::tempdir().unwrap();
        let node = CommandNode::new(NodeCommands::default());
        node.load(NodeOs::Linux, &[], dir.path()).unwrap();
        let err = node
            .load(NodeOs::Linux, &["a.io/b:c".to_owned()], dir.path())
            .unwrap_err();
        assert!(matches!(err, NodeError::NotConfigured("image load")));
    }

    #[test]
    fn unset_install_template_fails_for_linux_packages() {
        let dir = tempfile::tempdir().unwrap();
        let node = CommandNode::new(NodeCommands::default());
        node.install(&PackageSet::default(), dir.path()).unwrap();
        let mut packages = PackageSet::default();
        packages.linux.deb.push("curl".to_owned());
        let err = node.install(&packages, dir.path()).unwrap_err();
        assert!(matches!(err, NodeError::NotConfigured("package install")));
    }

    #[cfg(unix)]
    #[test]
    fn save_runs_template_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let node = CommandNode::new(NodeCommands {
            image_save: Some("touch {archive}".to_owned()),
            ..NodeCommands::default()
        });
        let images = vec!["a.io/one:1".to_owned(), "b.io/two:2".to_owned()];
        let written = node.save(NodeOs::Linux, &images, dir.path()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("a.io_one_1.tar").is_file());
        assert!(dir.path().join("b.io_two_2.tar").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let node = CommandNode::new(NodeCommands {
            image_save: Some("false {archive}".to_owned()),
            ..NodeCommands::default()
        });
        let err = node
            .save(NodeOs::Windows, &["a.io/one:1".to_owned()], dir.path())
            .unwrap_err();
        assert!(matches!(err, NodeError::CommandFailed { .. }));
    }

    #[test]
    fn load_fails_for_image_without_archive() {
        let dir = tempfile::tempdir().unwrap();
        let node = CommandNode::new(NodeCommands {
            image_load: Some("true {archive}".to_owned()),
            ..NodeCommands::default()
        });
        let err = node
            .load(NodeOs::Linux, &["a.io/one:1".to_owned()], dir.path())
            .unwrap_err();
        match err {
            NodeError::MissingArchive { image, path } => {
                assert_eq!(image, "a.io/one:1");
                assert_eq!(path, dir.path().join("a.io_one_1.tar"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn load_runs_template_per_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.io_one_1.tar"), "image").unwrap();
        let node = CommandNode::new(NodeCommands {
            image_load: Some("test -s {archive}".to_owned()),
            ..NodeCommands::default()
        });
        node.load(NodeOs::Linux, &["a.io/one:1".to_owned()], dir.path())
            .unwrap();
    }
}
