use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{BytesParameter, BytesResolver, ResolveError};

/// Path of parameter names from the top level down, `["bytes"]` for a top-level parameter.
pub type KeyPath = Vec<String>;

/// A local copy of a blob parameter, opened for reading.
#[derive(Debug)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub file: File,
}

#[derive(Debug)]
pub enum ResolvedParameter {
    Value(Value),
    File(ResolvedFile),
}

impl ResolvedParameter {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&ResolvedFile> {
        match self {
            Self::File(file) => Some(file),
            Self::Value(_) => None,
        }
    }
}

/// Downloads the parameters named by `keys` into `working_directory`.
///
/// The working directory belongs to the resolver and is removed on
/// [`cleanup`](Self::cleanup), on drop, and when `resolve` fails.
pub struct ParameterResolver {
    parameters: Map<String, Value>,
    keys: Vec<KeyPath>,
    working_directory: PathBuf,
    resolvers: HashMap<String, Arc<dyn BytesResolver>>,
}

impl ParameterResolver {
    pub fn new(
        parameters: Map<String, Value>,
        keys: Vec<KeyPath>,
        working_directory: impl Into<PathBuf>,
        resolvers: HashMap<String, Arc<dyn BytesResolver>>,
    ) -> Self {
        Self {
            parameters,
            keys,
            working_directory: working_directory.into(),
            resolvers,
        }
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn resolve(&self) -> Result<BTreeMap<String, ResolvedParameter>, ResolveError> {
        if self.keys.is_empty() {
            return Ok(self
                .parameters
                .iter()
                .map(|(key, value)| (key.clone(), ResolvedParameter::Value(value.clone())))
                .collect());
        }

        self.resolve_all().inspect_err(|_| self.cleanup())
    }

    fn resolve_all(&self) -> Result<BTreeMap<String, ResolvedParameter>, ResolveError> {
        fs::create_dir_all(&self.working_directory)?;

        let mut resolved = BTreeMap::new();
        for (key, value) in &self.parameters {
            let path = self.keys.iter().find(|path| path.first() == Some(key));
            let parameter = match path {
                None => ResolvedParameter::Value(value.clone()),
                Some(path) if path.len() == 1 => self.resolve_one(key, value)?,
                Some(path) => return Err(ResolveError::NestedUnsupported(path.join("."))),
            };
            resolved.insert(key.clone(), parameter);
        }
        Ok(resolved)
    }

    fn resolve_one(&self, key: &str, value: &Value) -> Result<ResolvedParameter, ResolveError> {
        let bytes: BytesParameter =
            serde_json::from_value(value.clone()).map_err(|e| ResolveError::InvalidParameter {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let resolver = self
            .resolvers
            .get(&bytes.kind)
            .ok_or_else(|| ResolveError::NoResolver(bytes.kind.clone()))?;

        if bytes.filename.is_empty() || bytes.filename.contains(['/', '\\']) || bytes.filename == ".." {
            return Err(ResolveError::InvalidParameter {
                key: key.to_string(),
                reason: format!("unusable filename {:?}", bytes.filename),
            });
        }

        let path = self.working_directory.join(&bytes.filename);
        {
            let mut writer = File::create(&path)?;
            resolver.resolve(&bytes, &mut writer)?;
        }
        debug!(key, path = %path.display(), "Resolved bytes parameter");

        let file = File::open(&path)?;
        Ok(ResolvedParameter::File(ResolvedFile { path, file }))
    }

    /// Removes the working directory and everything resolved into it.
    pub fn cleanup(&self) {
        if !self.working_directory.is_dir() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.working_directory) {
            warn!(
                error = %e,
                path = %self.working_directory.display(),
                "Failed to remove parameter working directory"
            );
        }
    }
}

impl Drop for ParameterResolver {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};

    struct FixedResolver(&'static [u8]);

    impl BytesResolver for FixedResolver {
        fn resolve(&self, _value: &BytesParameter, writer: &mut dyn Write) -> Result<(), ResolveError> {
            writer.write_all(self.0)?;
            Ok(())
        }
    }

    struct FailingResolver;

    impl BytesResolver for FailingResolver {
        fn resolve(&self, value: &BytesParameter, _writer: &mut dyn Write) -> Result<(), ResolveError> {
            Err(ResolveError::Store {
                id: value.id.clone(),
                reason: "not found".to_string(),
            })
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("resolver-{}", uuid::Uuid::new_v4()))
    }

    fn bytes_param() -> Value {
        json!({
            "type": "test",
            "filename": "testfile",
            "content_type": "text/plain",
            "id": "5cd2152c759cb4d72646a59a",
        })
    }

    fn resolvers(resolver: Arc<dyn BytesResolver>) -> HashMap<String, Arc<dyn BytesResolver>> {
        HashMap::from([("test".to_string(), resolver)])
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_trivial_resolve() {
        let dir = scratch_dir();
        let resolver = ParameterResolver::new(
            params(json!({"foo": "bar"})),
            vec![],
            &dir,
            resolvers(Arc::new(FixedResolver(b""))),
        );

        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved["foo"].as_value(), Some(&json!("bar")));
        assert!(!dir.exists());
    }

    #[test]
    fn test_resolve_writes_file() {
        let dir = scratch_dir();
        let resolver = ParameterResolver::new(
            params(json!({"bytes": bytes_param(), "message": "hi"})),
            vec![vec!["bytes".to_string()]],
            &dir,
            resolvers(Arc::new(FixedResolver(b"file contents"))),
        );

        let resolved = resolver.resolve().unwrap();
        assert_eq!(resolved["message"].as_value(), Some(&json!("hi")));

        let file = resolved["bytes"].as_file().unwrap();
        assert_eq!(file.path, dir.join("testfile"));
        let mut contents = String::new();
        (&file.file).read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "file contents");

        let names: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["testfile"]);

        drop(resolver);
        assert!(!dir.exists());
    }

    #[test]
    fn test_nested_key_unsupported() {
        let dir = scratch_dir();
        let resolver = ParameterResolver::new(
            params(json!({"outer": {"bytes": bytes_param()}})),
            vec![vec!["outer".to_string(), "bytes".to_string()]],
            &dir,
            resolvers(Arc::new(FixedResolver(b""))),
        );

        let err = resolver.resolve().unwrap_err();
        assert!(matches!(err, ResolveError::NestedUnsupported(path) if path == "outer.bytes"));
        assert!(!dir.exists());
    }

    #[test]
    fn test_missing_resolver() {
        let dir = scratch_dir();
        let resolver = ParameterResolver::new(
            params(json!({"bytes": bytes_param()})),
            vec![vec!["bytes".to_string()]],
            &dir,
            HashMap::new(),
        );

        let err = resolver.resolve().unwrap_err();
        assert!(matches!(err, ResolveError::NoResolver(kind) if kind == "test"));
        assert!(!dir.exists());
    }

    #[test]
    fn test_resolver_failure_cleans_up() {
        let dir = scratch_dir();
        let resolver = ParameterResolver::new(
            params(json!({"bytes": bytes_param()})),
            vec![vec!["bytes".to_string()]],
            &dir,
            resolvers(Arc::new(FailingResolver)),
        );

        assert!(matches!(
            resolver.resolve(),
            Err(ResolveError::Store { .. })
        ));
        assert!(!dir.exists());
    }

    #[test]
    fn test_filename_cannot_escape_working_directory() {
        let dir = scratch_dir();
        let mut value = bytes_param();
        value["filename"] = json!("../escape");
        let resolver = ParameterResolver::new(
            params(json!({"bytes": value})),
            vec![vec!["bytes".to_string()]],
            &dir,
            resolvers(Arc::new(FixedResolver(b"x"))),
        );

        assert!(matches!(
            resolver.resolve(),
            Err(ResolveError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_cleanup_missing_directory() {
        let resolver = ParameterResolver::new(Map::new(), vec![], scratch_dir(), HashMap::new());
        resolver.cleanup();
    }
}
