//! Registry of `{{_name}}` fake-data generators.
//!
//! The registry is built once per engine and shared by every iteration.
//! Generators draw from a single seeded RNG behind a mutex, so concurrent
//! injections are serialised through a short critical section.

use crate::value::Value;
use chrono::{Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt;

type Generator = fn(&mut StdRng) -> Value;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Grace", "Linus", "Margaret", "Dennis", "Barbara", "Ken", "Radia", "Edsger",
    "Frances", "Donald",
];
const LAST_NAMES: &[&str] = &[
    "Lovelace", "Turing", "Hopper", "Torvalds", "Hamilton", "Ritchie", "Liskov", "Thompson",
    "Perlman", "Dijkstra", "Allen", "Knuth",
];
const CITIES: &[&str] = &[
    "Amsterdam", "Berlin", "Cairo", "Denver", "Istanbul", "Lisbon", "Nairobi", "Osaka", "Quito",
    "Seoul", "Toronto", "Vienna",
];
const COUNTRIES: &[(&str, &str)] = &[
    ("Brazil", "BR"),
    ("Canada", "CA"),
    ("Germany", "DE"),
    ("Japan", "JP"),
    ("Kenya", "KE"),
    ("Netherlands", "NL"),
    ("Portugal", "PT"),
    ("Turkey", "TR"),
    ("United States", "US"),
];
const COLORS: &[&str] = &[
    "red", "green", "blue", "orange", "purple", "teal", "olive", "maroon", "navy", "silver",
];
const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "labore", "magna", "aliqua",
];
const TLDS: &[&str] = &["com", "net", "org", "io", "dev"];
const CURRENCIES: &[&str] = &["USD", "EUR", "GBP", "JPY", "TRY", "CAD", "CHF", "BRL"];
const JOB_TITLES: &[&str] = &[
    "Software Engineer",
    "Product Manager",
    "Data Analyst",
    "Site Reliability Engineer",
    "Designer",
    "Support Specialist",
];
const COMPANY_SUFFIXES: &[&str] = &["Inc", "LLC", "Group", "Labs", "Systems"];

fn pick<'a>(rng: &mut StdRng, items: &'a [&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn alnum(rng: &mut StdRng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn word(rng: &mut StdRng) -> String {
    pick(rng, WORDS).to_string()
}

fn domain(rng: &mut StdRng) -> String {
    format!("{}.{}", word(rng), pick(rng, TLDS))
}

fn user_name(rng: &mut StdRng) -> String {
    format!(
        "{}.{}{}",
        pick(rng, FIRST_NAMES).to_lowercase(),
        pick(rng, LAST_NAMES).to_lowercase(),
        rng.gen_range(1..100)
    )
}

fn entry(name: &'static str, generator: Generator) -> (&'static str, Generator) {
    (name, generator)
}

fn builtins() -> Vec<(&'static str, Generator)> {
    vec![
        entry("_guid", |_| Value::String(uuid::Uuid::new_v4().to_string())),
        entry("_randomUUID", |_| {
            Value::String(uuid::Uuid::new_v4().to_string())
        }),
        entry("_randomInt", |rng| Value::Int(rng.gen_range(0..1000))),
        entry("_randomFloat", |rng| {
            Value::Float((rng.gen_range(0.0..1000.0_f64) * 100.0).round() / 100.0)
        }),
        entry("_randomBoolean", |rng| Value::Bool(rng.gen())),
        entry("_randomString", |rng| {
            let len = rng.gen_range(8..16);
            Value::String(alnum(rng, len))
        }),
        entry("_randomAlphaNumeric", |rng| Value::String(alnum(rng, 1))),
        entry("_randomEmail", |rng| {
            Value::String(format!("{}@{}", user_name(rng), domain(rng)))
        }),
        entry("_randomUserName", |rng| Value::String(user_name(rng))),
        entry("_randomFirstName", |rng| {
            Value::String(pick(rng, FIRST_NAMES).to_string())
        }),
        entry("_randomLastName", |rng| {
            Value::String(pick(rng, LAST_NAMES).to_string())
        }),
        entry("_randomFullName", |rng| {
            Value::String(format!(
                "{} {}",
                pick(rng, FIRST_NAMES),
                pick(rng, LAST_NAMES)
            ))
        }),
        entry("_randomCity", |rng| Value::String(pick(rng, CITIES).to_string())),
        entry("_randomCountry", |rng| {
            let (name, _) = COUNTRIES[rng.gen_range(0..COUNTRIES.len())];
            Value::String(name.to_string())
        }),
        entry("_randomCountryCode", |rng| {
            let (_, code) = COUNTRIES[rng.gen_range(0..COUNTRIES.len())];
            Value::String(code.to_string())
        }),
        entry("_randomIP", |rng| {
            let octets: [u8; 4] = rng.gen();
            Value::String(std::net::Ipv4Addr::from(octets).to_string())
        }),
        entry("_randomIPV6", |rng| {
            let segments: [u16; 8] = rng.gen();
            Value::String(std::net::Ipv6Addr::from(segments).to_string())
        }),
        entry("_randomPhoneNumber", |rng| {
            Value::String(format!(
                "{}-{}-{}",
                rng.gen_range(200..1000),
                rng.gen_range(200..1000),
                rng.gen_range(1000..10000)
            ))
        }),
        entry("_randomColor", |rng| Value::String(pick(rng, COLORS).to_string())),
        entry("_randomHexColor", |rng| {
            Value::String(format!("#{:06x}", rng.gen_range(0..0x100_0000)))
        }),
        entry("_randomUrl", |rng| {
            Value::String(format!("https://{}", domain(rng)))
        }),
        entry("_randomDomainName", |rng| Value::String(domain(rng))),
        entry("_randomWord", |rng| Value::String(word(rng))),
        entry("_randomLoremSentence", |rng| {
            let len = rng.gen_range(5..12);
            let words: Vec<String> = (0..len).map(|_| word(rng)).collect();
            let mut sentence = words.join(" ");
            if let Some(first) = sentence.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            sentence.push('.');
            Value::String(sentence)
        }),
        entry("_timestamp", |_| Value::Int(Utc::now().timestamp())),
        entry("_isoTimestamp", |_| {
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        }),
        entry("_randomDateFuture", |rng| {
            let t = Utc::now() + Duration::seconds(rng.gen_range(60..365 * 24 * 3600));
            Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true))
        }),
        entry("_randomDatePast", |rng| {
            let t = Utc::now() - Duration::seconds(rng.gen_range(60..365 * 24 * 3600));
            Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true))
        }),
        entry("_randomPrice", |rng| {
            Value::String(format!("{:.2}", rng.gen_range(1.0..1000.0_f64)))
        }),
        entry("_randomCurrencyCode", |rng| {
            Value::String(pick(rng, CURRENCIES).to_string())
        }),
        entry("_randomJobTitle", |rng| {
            Value::String(pick(rng, JOB_TITLES).to_string())
        }),
        entry("_randomCompanyName", |rng| {
            Value::String(format!(
                "{} {}",
                pick(rng, LAST_NAMES),
                pick(rng, COMPANY_SUFFIXES)
            ))
        }),
    ]
}

pub struct Registry {
    generators: BTreeMap<&'static str, Generator>,
    rng: Mutex<StdRng>,
}

impl Registry {
    /// Registry with every built-in generator and an entropy-seeded RNG.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic registry, for tests and reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            generators: builtins().into_iter().collect(),
            rng: Mutex::new(rng),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.generators.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.generators.keys().copied()
    }

    /// Produce a fresh value from the generator called `name`.
    pub fn generate(&self, name: &str) -> Option<Value> {
        let generator = self.generators.get(name)?;
        let mut rng = self.rng.lock();
        Some(generator(&mut rng))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("generators", &self.generators.len())
            .finish()
    }
}
