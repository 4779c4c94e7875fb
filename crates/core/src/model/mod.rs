//! Data model shared by the registry, resolver, compiler and scheduler.

pub mod language;
pub mod processor;
pub mod reference;

pub use language::check_language;
pub use processor::{
  ConfigKeySpec, DataType, ParamRole, ParamSpec, PreloaderSpec, ProcessorInfo, ProcessorKind, WildcardKind,
  WildcardSpec,
};
pub use reference::{parse_annotation_list, Reference};
