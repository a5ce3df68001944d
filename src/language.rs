use std::collections::HashMap;

use crate::config::LanguageConfig;

/// Placeholder expanded to the source filename inside command templates
const SOURCE_PLACEHOLDER: &str = "%SOURCE%";

/// How to build and run programs written in one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub key: String,
    pub source_file: String,
    pub compile: Option<String>,
    pub run: String,
}

impl LanguageSpec {
    pub fn new(key: &str, source_file: &str, compile: Option<&str>, run: &str) -> Self {
        Self {
            key: key.to_string(),
            source_file: source_file.to_string(),
            compile: compile.map(str::to_string),
            run: run.to_string(),
        }
    }

    /// Compile command with placeholders substituted, if the language needs one
    pub fn compile_command(&self) -> Option<String> {
        self.compile.as_deref().map(|c| self.apply_template(c))
    }

    pub fn run_command(&self) -> String {
        self.apply_template(&self.run)
    }

    fn apply_template(&self, template: &str) -> String {
        template.replace(SOURCE_PLACEHOLDER, &self.source_file)
    }
}

impl From<&LanguageConfig> for LanguageSpec {
    fn from(config: &LanguageConfig) -> Self {
        Self {
            key: config.name.clone(),
            source_file: config.file_name.clone(),
            compile: config.compile.clone(),
            run: config.run.clone(),
        }
    }
}

/// Static mapping from a language key to its [`LanguageSpec`]
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    specs: HashMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    /// Registry with the languages every deployment supports out of the box
    pub fn builtin() -> Self {
        let specs = [
            LanguageSpec::new("js", "main.js", None, "node main.js"),
            LanguageSpec::new("python", "main.py", None, "python3 main.py"),
            LanguageSpec::new(
                "cpp",
                "main.cpp",
                Some("g++ main.cpp -O2 -std=c++17 -o main"),
                "./main",
            ),
            LanguageSpec::new("java", "Main.java", Some("javac Main.java"), "java Main"),
        ];

        Self {
            specs: specs.into_iter().map(|s| (s.key.clone(), s)).collect(),
        }
    }

    /// Built-in languages extended (or overridden) by configured ones
    pub fn with_config(configs: &[LanguageConfig]) -> Self {
        let mut registry = Self::builtin();
        for config in configs {
            if registry.specs.contains_key(&config.name) {
                log::info!("Language {} overridden by configuration", config.name);
            }
            registry.insert(LanguageSpec::from(config));
        }
        registry
    }

    pub fn insert(&mut self, spec: LanguageSpec) {
        self.specs.insert(spec.key.clone(), spec);
    }

    pub fn get(&self, key: &str) -> Option<&LanguageSpec> {
        self.specs.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.specs.contains_key(key)
    }
}
