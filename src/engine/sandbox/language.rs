use std::collections::{BTreeMap, HashMap};

use crate::engine::error::{ConfigError, ExecutionError};

/// Maps the in-sandbox path of the source file to the argv that builds and
/// runs it.
pub type BuildCommand = fn(&str) -> Vec<String>;

#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub image: String,
    pub source_file_name: &'static str,
    pub build_command: BuildCommand,
}

impl LanguageSpec {
    fn new(image: &str, source_file_name: &'static str, build_command: BuildCommand) -> Self {
        Self {
            image: image.to_string(),
            source_file_name,
            build_command,
        }
    }

    pub fn command_for(&self, source_path: &str) -> Vec<String> {
        (self.build_command)(source_path)
    }
}

#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: BTreeMap<&'static str, LanguageSpec>,
}

impl LanguageRegistry {
    pub fn builtin() -> Self {
        let languages = BTreeMap::from([
            (
                "javascript",
                LanguageSpec::new("node:18-alpine", "index.js", |path| {
                    argv(&["node", path])
                }),
            ),
            (
                "python",
                LanguageSpec::new("python:3.9-slim", "script.py", |path| {
                    argv(&["python", "-u", path])
                }),
            ),
            (
                "java",
                LanguageSpec::new("openjdk:17-jdk-slim", "Main.java", |path| {
                    let dir = parent_dir(path);
                    shell(&format!(
                        "javac -d {dir} {src} && java -cp {dir} Main",
                        dir = shell_quote(dir),
                        src = shell_quote(path),
                    ))
                }),
            ),
            (
                "cpp",
                LanguageSpec::new("gcc:latest", "main.cpp", |path| {
                    compile_and_run("g++", path)
                }),
            ),
            (
                "c",
                LanguageSpec::new("gcc:latest", "main.c", |path| compile_and_run("gcc", path)),
            ),
            (
                "php",
                LanguageSpec::new("php:8-cli-alpine", "index.php", |path| {
                    argv(&["php", path])
                }),
            ),
            (
                "rust",
                LanguageSpec::new("rust:1.76-alpine", "main.rs", |path| {
                    compile_and_run("rustc", path)
                }),
            ),
        ]);
        Self { languages }
    }

    /// Replaces images of known languages; naming an unknown language is a
    /// configuration error.
    pub fn with_image_overrides(
        mut self,
        overrides: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        for (language, image) in overrides {
            let spec = self
                .languages
                .get_mut(language.as_str())
                .ok_or_else(|| ConfigError::Invalid {
                    key: "LANGUAGE_IMAGES",
                    reason: format!("unknown language {language}"),
                })?;
            spec.image = image.clone();
        }
        Ok(self)
    }

    pub fn lookup(&self, language: &str) -> Result<&LanguageSpec, ExecutionError> {
        self.languages
            .get(language)
            .ok_or_else(|| ExecutionError::UnsupportedLanguage(language.to_string()))
    }

    pub fn languages(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.languages.keys().copied()
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn shell(script: &str) -> Vec<String> {
    argv(&["sh", "-c", script])
}

fn compile_and_run(compiler: &str, path: &str) -> Vec<String> {
    let binary = format!("{}/main", parent_dir(path));
    shell(&format!(
        "{compiler} {src} -o {bin} && {bin}",
        src = shell_quote(path),
        bin = shell_quote(&binary),
    ))
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => ".",
    }
}

/// Single-quotes `value` for `sh -c`, so paths never get word-split or
/// expanded.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{LanguageRegistry, shell_quote};
    use crate::engine::error::{ConfigError, ExecutionError};

    #[test]
    fn interpreted_languages_use_direct_argv() {
        let registry = LanguageRegistry::builtin();
        let python = registry.lookup("python").expect("python");
        assert_eq!(python.source_file_name, "script.py");
        assert_eq!(
            python.command_for("/app/script.py"),
            vec!["python", "-u", "/app/script.py"]
        );
        let js = registry.lookup("javascript").expect("javascript");
        assert_eq!(js.command_for("/app/index.js"), vec!["node", "/app/index.js"]);
    }

    #[test]
    fn compiled_languages_quote_paths() {
        let registry = LanguageRegistry::builtin();
        let c = registry.lookup("c").expect("c");
        assert_eq!(
            c.command_for("/app/main.c"),
            vec![
                "sh",
                "-c",
                "gcc '/app/main.c' -o '/app/main' && '/app/main'"
            ]
        );
        let java = registry.lookup("java").expect("java");
        assert_eq!(
            java.command_for("/app/Main.java")[2],
            "javac -d '/app' '/app/Main.java' && java -cp '/app' Main"
        );
    }

    #[test]
    fn unknown_language_is_rejected() {
        let registry = LanguageRegistry::builtin();
        let err = registry.lookup("ruby").unwrap_err();
        assert!(matches!(err, ExecutionError::UnsupportedLanguage(ref l) if l == "ruby"));
        assert!(registry.lookup("Python").is_err());
    }

    #[test]
    fn lookup_is_deterministic() {
        let registry = LanguageRegistry::builtin();
        for language in registry.languages() {
            let a = registry.lookup(language).expect("registered");
            let b = registry.lookup(language).expect("registered");
            assert_eq!(a.image, b.image);
            assert_eq!(
                a.command_for("/app/src"),
                b.command_for("/app/src"),
                "{language}"
            );
        }
    }

    #[test]
    fn source_file_names_are_plain() {
        let registry = LanguageRegistry::builtin();
        for language in registry.languages() {
            let name = registry.lookup(language).expect("registered").source_file_name;
            assert!(!name.contains('/') && !name.starts_with('.'), "{name}");
        }
    }

    #[test]
    fn overrides_replace_images() {
        let overrides = HashMap::from([("python".to_string(), "python:3.12-slim".to_string())]);
        let registry = LanguageRegistry::builtin()
            .with_image_overrides(&overrides)
            .expect("known language");
        assert_eq!(registry.lookup("python").expect("python").image, "python:3.12-slim");

        let bad = HashMap::from([("cobol".to_string(), "cobol:1".to_string())]);
        let err = LanguageRegistry::builtin().with_image_overrides(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("/app/it's.c"), r"'/app/it'\''s.c'");
    }
}
