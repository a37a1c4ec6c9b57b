//! CSV-backed test data.
//!
//! Each named source is read once at start-up from a local path or an
//! `http(s)` URL. Every iteration draws one row per source and exposes the
//! tagged columns as `data.<source>.<tag>`.

use crate::error::PlanError;
use crate::value::Value;
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConf {
    pub path: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub skip_first_line: bool,
    #[serde(default)]
    pub skip_empty_line: bool,
    #[serde(default)]
    pub allow_quote: bool,
    #[serde(default = "default_order")]
    pub order: String,
    #[serde(default)]
    pub vars: BTreeMap<String, CsvVar>,
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_order() -> String {
    "random".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvVar {
    pub tag: String,
    #[serde(rename = "type", default)]
    pub kind: CellType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    #[default]
    String,
    Int,
    Float,
    Bool,
    Json,
}

impl CellType {
    fn convert(self, cell: &str) -> Result<Value, String> {
        match self {
            CellType::String => Ok(Value::String(cell.to_string())),
            CellType::Int => cell
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| e.to_string()),
            CellType::Float => cell
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| e.to_string()),
            CellType::Bool => cell
                .trim()
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|e| e.to_string()),
            CellType::Json => serde_json::from_str::<serde_json::Value>(cell)
                .map(Value::from_json)
                .map_err(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOrder {
    Sequential,
    Random,
}

impl DrawOrder {
    pub fn parse(order: &str) -> Option<Self> {
        match order {
            "sequential" => Some(DrawOrder::Sequential),
            "random" => Some(DrawOrder::Random),
            _ => None,
        }
    }
}

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct DataSource {
    pub name: String,
    order: DrawOrder,
    rows: Vec<Row>,
}

impl DataSource {
    /// Read the source described by `conf`, fetching it first when the path
    /// is a URL.
    pub async fn load(name: &str, conf: &CsvConf) -> Result<Self> {
        let content = if conf.path.starts_with("http://") || conf.path.starts_with("https://") {
            info!("Fetching test data '{}' from {}", name, conf.path);
            reqwest::get(&conf.path)
                .await
                .and_then(|r| r.error_for_status())
                .context(format!("Failed to fetch test data: {}", conf.path))?
                .bytes()
                .await
                .context(format!("Failed to read test data body: {}", conf.path))?
                .to_vec()
        } else {
            tokio::fs::read(&conf.path)
                .await
                .context(format!("Failed to read test data file: {}", conf.path))?
        };
        let source = Self::from_csv(name, conf, content.as_slice())?;
        debug!("Loaded {} rows for data source '{}'", source.len(), name);
        Ok(source)
    }

    /// Parse CSV content according to `conf`.
    pub fn from_csv(name: &str, conf: &CsvConf, content: &[u8]) -> Result<Self, PlanError> {
        let data_err = |message: String| PlanError::Data {
            source_name: name.to_string(),
            message,
        };

        let order = DrawOrder::parse(&conf.order)
            .ok_or_else(|| data_err(format!("unknown order '{}'", conf.order)))?;
        let delimiter = match conf.delimiter.as_bytes() {
            [b] => *b,
            _ => return Err(data_err(format!("invalid delimiter '{}'", conf.delimiter))),
        };

        let mut columns = Vec::with_capacity(conf.vars.len());
        for (index, var) in &conf.vars {
            let index = index
                .parse::<usize>()
                .map_err(|_| data_err(format!("column key '{index}' is not an index")))?;
            columns.push((index, var));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter)
            .quoting(conf.allow_quote)
            .from_reader(content);

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| data_err(e.to_string()))?;
            if line == 0 && conf.skip_first_line {
                continue;
            }
            if conf.skip_empty_line && record.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }

            let mut row = Row::new();
            for (index, var) in &columns {
                let cell = record.get(*index).ok_or_else(|| {
                    data_err(format!("row {}: column {} is missing", line + 1, index))
                })?;
                let value = var.kind.convert(cell).map_err(|e| {
                    data_err(format!("row {}, column {}: {}", line + 1, index, e))
                })?;
                row.insert(var.tag.clone(), value);
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(data_err("no rows".to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            order,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row used by iteration `index`.
    pub fn draw(&self, index: u64) -> &Row {
        let i = match self.order {
            DrawOrder::Sequential => (index % self.rows.len() as u64) as usize,
            DrawOrder::Random => rand::thread_rng().gen_range(0..self.rows.len()),
        };
        &self.rows[i]
    }
}

/// All data sources of a plan.
#[derive(Debug, Clone, Default)]
pub struct TestData {
    sources: Vec<DataSource>,
}

impl TestData {
    pub fn new(sources: Vec<DataSource>) -> Self {
        Self { sources }
    }

    pub async fn load(confs: &BTreeMap<String, CsvConf>) -> Result<Self> {
        let mut sources = Vec::with_capacity(confs.len());
        for (name, conf) in confs {
            sources.push(DataSource::load(name, conf).await?);
        }
        Ok(Self { sources })
    }

    /// Environment entries for iteration `index`.
    pub fn draw(&self, index: u64) -> Vec<(String, Value)> {
        let mut vars = Vec::new();
        for source in &self.sources {
            for (tag, value) in source.draw(index) {
                vars.push((format!("data.{}.{}", source.name, tag), value.clone()));
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(order: &str) -> CsvConf {
        let mut vars = BTreeMap::new();
        vars.insert(
            "0".to_string(),
            CsvVar {
                tag: "email".into(),
                kind: CellType::String,
            },
        );
        vars.insert(
            "1".to_string(),
            CsvVar {
                tag: "age".into(),
                kind: CellType::Int,
            },
        );
        CsvConf {
            path: "unused.csv".into(),
            delimiter: ";".into(),
            skip_first_line: true,
            skip_empty_line: true,
            allow_quote: true,
            order: order.into(),
            vars,
        }
    }

    const CSV: &[u8] = b"email;age\na@x.io;31\n\nb@x.io;40\n";

    #[test]
    fn test_parse_typed_rows() {
        let source = DataSource::from_csv("users", &conf("sequential"), CSV).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.draw(0).get("email"), Some(&Value::from("a@x.io")));
        assert_eq!(source.draw(0).get("age"), Some(&Value::Int(31)));
        assert_eq!(source.draw(3).get("age"), Some(&Value::Int(40)));
    }

    #[test]
    fn test_environment_keys() {
        let source = DataSource::from_csv("users", &conf("sequential"), CSV).unwrap();
        let data = TestData::new(vec![source]);
        let vars: BTreeMap<_, _> = data.draw(1).into_iter().collect();
        assert_eq!(vars.get("data.users.email"), Some(&Value::from("b@x.io")));
    }

    #[test]
    fn test_random_draw_stays_in_range() {
        let source = DataSource::from_csv("users", &conf("random"), CSV).unwrap();
        for i in 0..50 {
            assert!(source.draw(i).contains_key("email"));
        }
    }

    #[test]
    fn test_conversion_error_names_row_and_column() {
        let err = DataSource::from_csv("users", &conf("sequential"), b"h;h\nx@y;old\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("row 2, column 1"), "{err}");
    }

    #[test]
    fn test_rejects_unknown_order() {
        assert!(DataSource::from_csv("users", &conf("shuffled"), CSV).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.csv");
        std::fs::write(&path, CSV).unwrap();
        let mut c = conf("sequential");
        c.path = path.display().to_string();
        let source = DataSource::load("users", &c).await.unwrap();
        assert_eq!(source.len(), 2);
    }
}
