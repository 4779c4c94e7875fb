//! Installation of XML exports: copy (or rsync) the export subdirectory to
//! a configured target, with the marker discipline installers require.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use weft_core::exec::{Handler, JobContext, tools};
use weft_core::model::{ConfigKeySpec, ParamRole, ParamSpec, ProcessorInfo, ProcessorKind, Reference};
use weft_core::registry::ModuleSet;
use weft_core::{Error, Result};

const EXPORT_SUBDIR: &str = "xml_export.pretty";

pub fn module() -> ModuleSet {
  let install = ProcessorInfo {
    module: "xml_install".into(),
    name: "copy".into(),
    kind: ProcessorKind::Installer,
    description: "Install the XML export by copying it to the configured target.\n\nRemote \
                  targets (host:path) go through rsync; local targets are plain copies."
      .into(),
    params: vec![
      ParamSpec::new(
        "exports",
        ParamRole::ExportInput {
          path: format!("{EXPORT_SUBDIR}/{{file}}_export.xml"),
          all_files: true,
        },
      ),
      ParamSpec::new(
        "target",
        ParamRole::Config {
          key: "xml_install.target".into(),
          default: None,
        },
      ),
      ParamSpec::new(
        "marker",
        ParamRole::Marker {
          reference: Reference::new("xml_install.installed"),
        },
      ),
      ParamSpec::new(
        "uninstall_marker",
        ParamRole::MarkerOptional {
          reference: Reference::new("xml_install.removed"),
        },
      ),
    ],
    language: vec![],
    config: vec![ConfigKeySpec::new(
      "xml_install.target",
      "Destination directory (local path or rsync host:path)",
    )],
    priority: 0,
    order: None,
    wildcards: vec![],
    preloader: None,
    file_extension: None,
    import_outputs: vec![],
    text_annotation: None,
    is_abstract: false,
    uninstaller: Some("xml_install:remove".into()),
  };

  let mut remove = install.clone();
  remove.name = "remove".into();
  remove.kind = ProcessorKind::Uninstaller;
  remove.description = "Remove a previously installed XML export from a local target.".into();
  remove.uninstaller = None;
  remove.params = vec![
    ParamSpec::new(
      "target",
      ParamRole::Config {
        key: "xml_install.target".into(),
        default: None,
      },
    ),
    ParamSpec::new(
      "marker",
      ParamRole::Marker {
        reference: Reference::new("xml_install.removed"),
      },
    ),
    ParamSpec::new(
      "install_marker",
      ParamRole::MarkerOptional {
        reference: Reference::new("xml_install.installed"),
      },
    ),
  ];

  ModuleSet {
    name: "xml_install".into(),
    description: "Deployment of XML exports.".into(),
    language: vec![],
    config: vec![],
    processors: vec![(install, Arc::new(InstallXml)), (remove, Arc::new(RemoveXml))],
  }
}

struct InstallXml;

impl Handler for InstallXml {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let target = ctx.string("target")?.to_string();
    let source = ctx.export_input_path(EXPORT_SUBDIR);

    if target.contains(':') {
      tools::rsync(&source, &target)?;
    } else {
      copy_tree(&source, Path::new(&target))?;
    }
    info!(target = %target, "installed XML export");

    // Clear the uninstaller's marker so a later uninstall runs again
    ctx.remove_marker(ctx.annotation("uninstall_marker")?)?;
    ctx.write_marker(ctx.annotation("marker")?)
  }
}

struct RemoveXml;

impl Handler for RemoveXml {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let target = ctx.string("target")?.to_string();
    if target.contains(':') {
      return Err(Error::User("uninstalling from a remote target is not supported".into()));
    }
    match std::fs::remove_dir_all(&target) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e.into()),
    }
    info!(target = %target, "removed installed XML export");

    ctx.remove_marker(ctx.annotation("install_marker")?)?;
    ctx.write_marker(ctx.annotation("marker")?)
  }
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
  if !source.is_dir() {
    return Err(Error::User(format!("nothing to install: {} is missing", source.display())));
  }
  std::fs::create_dir_all(target)?;
  for entry in std::fs::read_dir(source)? {
    let entry = entry?;
    let destination = target.join(entry.file_name());
    if entry.path().is_dir() {
      copy_tree(&entry.path(), &destination)?;
    } else {
      std::fs::copy(entry.path(), &destination)?;
    }
  }
  Ok(())
}
