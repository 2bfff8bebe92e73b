use crate::config::ApiMode;
use crate::models::Conversation;
use anyhow::{Context, Result, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;

/// Declared shape of one API parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDoc {
    /// JSON schema type name (`string`, `integer`, `number`, `boolean`, `array`, `object`)
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// One API exposed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterDoc>,
}

impl ApiDoc {
    /// Render as an OpenAI function schema. With `disable_docs` every
    /// description is blanked; names, types and required lists are kept.
    pub fn to_function_doc(&self, disable_docs: bool) -> Value {
        let describe = |text: &str| if disable_docs { String::new() } else { text.to_string() };

        let properties: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|(name, param)| {
                (
                    name.clone(),
                    json!({"type": param.kind, "description": describe(&param.description)}),
                )
            })
            .collect();

        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|(_, param)| param.required)
            .map(|(name, _)| name.as_str())
            .collect();

        json!({
            "name": self.name,
            "description": describe(&self.description),
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|(_, param)| param.required)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SuiteFile {
    name: String,
    #[serde(default)]
    apis: Vec<ApiDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    suites: Vec<SuiteFile>,
}

/// Immutable set of APIs, grouped into suites
#[derive(Debug, Clone, Default)]
pub struct ApiCatalog {
    apis: Vec<ApiDoc>,
    by_name: HashMap<String, usize>,
    suites: IndexMap<String, Vec<usize>>,
}

impl ApiCatalog {
    /// Load a catalog file: `{"suites": [{"name", "apis": [...]}]}`
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read API catalog: {}", path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse API catalog: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(content)?;
        let mut catalog = ApiCatalog::default();

        for suite in file.suites {
            let mut members = Vec::with_capacity(suite.apis.len());
            for api in suite.apis {
                if catalog.by_name.contains_key(&api.name) {
                    bail!("API {} is declared more than once", api.name);
                }
                let index = catalog.apis.len();
                catalog.by_name.insert(api.name.clone(), index);
                catalog.apis.push(api);
                members.push(index);
            }
            catalog.suites.insert(suite.name, members);
        }

        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&ApiDoc> {
        self.by_name.get(name).map(|&index| &self.apis[index])
    }

    pub fn suite(&self, name: &str) -> Option<Vec<&ApiDoc>> {
        self.suites
            .get(name)
            .map(|members| members.iter().map(|&index| &self.apis[index]).collect())
    }

    pub fn all(&self) -> &[ApiDoc] {
        &self.apis
    }

    /// APIs whose documentation the model sees for this conversation
    pub fn visible_apis(&self, mode: ApiMode, conversation: &Conversation) -> Result<Vec<&ApiDoc>> {
        match mode {
            ApiMode::Exact => conversation
                .apis_used
                .iter()
                .map(|name| {
                    self.get(name)
                        .with_context(|| format!("Unknown API in apis_used: {}", name))
                })
                .collect(),
            ApiMode::Suite => {
                let mut apis = Vec::new();
                for suite_name in &conversation.suites_used {
                    let suite = self
                        .suite(suite_name)
                        .with_context(|| format!("Unknown suite in suites_used: {}", suite_name))?;
                    apis.extend(suite);
                }
                Ok(apis)
            }
            ApiMode::All => Ok(self.all().iter().collect()),
        }
    }
}
