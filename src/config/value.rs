//! Placeholder expansion for configuration string values.
//!
//! A value is literal text interleaved with `(( ... ))` placeholders.
//! Parsing produces an immutable node tree; evaluation runs bottom-up, so
//! the innermost placeholders expand first. A placeholder's evaluated
//! content is split on `|` into trimmed tokens and dispatched against a
//! fixed function table keyed by leading tokens and total token count.
//! Entries are ordered longest prefix first within an arity; the first
//! match wins.

use super::{Config, ConfigError, ConfigView, Value};
use crate::files::get_path_names;
use crate::identity::IdentityField;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;

/// One raw string value being expanded against a configuration store.
pub(crate) struct ConfigValue<'a> {
    config: &'a Config,
    raw: &'a str,
}

#[derive(Debug, PartialEq)]
enum Node<'s> {
    Literal(&'s str),
    Placeholder(Vec<Node<'s>>),
}

/// Parse a run of literals and placeholders.
///
/// Returns the parsed nodes plus the text left over after this node's own
/// closing `))` (always empty at the top level). An opening `((` with no
/// `))` anywhere after it is an error, as is a top-level `))` with no
/// opener.
fn parse(mut value: &str, is_placeholder: bool) -> Result<(Vec<Node<'_>>, &str), ConfigError> {
    let mut nodes = Vec::new();

    loop {
        let open = value.find("((");
        let close = value.find("))");

        match (open, close) {
            (Some(_), None) => {
                return Err(ConfigError::Expand("missing end brackets".to_string()));
            }
            (Some(open), Some(close)) if open < close => {
                if open > 0 {
                    nodes.push(Node::Literal(&value[..open]));
                }

                let (children, rest) = parse(&value[open + 2..], true)?;
                nodes.push(Node::Placeholder(children));

                value = rest;
                if value.is_empty() {
                    break;
                }
            }
            (_, Some(close)) => {
                if !is_placeholder {
                    return Err(ConfigError::Expand("missing start brackets".to_string()));
                }

                if close > 0 {
                    nodes.push(Node::Literal(&value[..close]));
                }

                return Ok((nodes, &value[close + 2..]));
            }
            (None, None) => {
                if !value.is_empty() {
                    nodes.push(Node::Literal(value));
                }
                break;
            }
        }
    }

    Ok((nodes, ""))
}

enum PipeFunction {
    PlainKey,
    Env,
    Uuid,
    Base64Encode,
    Base64Decode,
    Default,
    Lookup,
    LookupOptional,
    FileText,
    FileData,
    FileTgz,
    If,
    AwsAccount,
    AwsUser,
    AwsArn,
}

struct DispatchEntry {
    prefix: &'static [&'static str],
    token_count: usize,
    function: PipeFunction,
}

const DISPATCH_TABLE: &[DispatchEntry] = &[
    DispatchEntry { prefix: &["aws_account"], token_count: 1, function: PipeFunction::AwsAccount },
    DispatchEntry { prefix: &["aws_account"], token_count: 2, function: PipeFunction::AwsAccount },
    DispatchEntry { prefix: &["aws_user"], token_count: 1, function: PipeFunction::AwsUser },
    DispatchEntry { prefix: &["aws_user"], token_count: 2, function: PipeFunction::AwsUser },
    DispatchEntry { prefix: &["aws_arn"], token_count: 1, function: PipeFunction::AwsArn },
    DispatchEntry { prefix: &["aws_arn"], token_count: 2, function: PipeFunction::AwsArn },
    DispatchEntry { prefix: &["env"], token_count: 2, function: PipeFunction::Env },
    DispatchEntry { prefix: &["env"], token_count: 3, function: PipeFunction::Env },
    DispatchEntry { prefix: &["uuid"], token_count: 2, function: PipeFunction::Uuid },
    DispatchEntry { prefix: &["base64_encode"], token_count: 2, function: PipeFunction::Base64Encode },
    DispatchEntry { prefix: &["base64_decode"], token_count: 2, function: PipeFunction::Base64Decode },
    DispatchEntry { prefix: &["default"], token_count: 2, function: PipeFunction::Default },
    DispatchEntry { prefix: &["default"], token_count: 3, function: PipeFunction::Default },
    DispatchEntry { prefix: &["lookup"], token_count: 3, function: PipeFunction::Lookup },
    DispatchEntry { prefix: &["lookup_optional"], token_count: 3, function: PipeFunction::LookupOptional },
    DispatchEntry { prefix: &["file", "text"], token_count: 3, function: PipeFunction::FileText },
    DispatchEntry { prefix: &["file", "data"], token_count: 3, function: PipeFunction::FileData },
    DispatchEntry { prefix: &["file", "tgz"], token_count: 4, function: PipeFunction::FileTgz },
    DispatchEntry { prefix: &["if"], token_count: 3, function: PipeFunction::If },
    DispatchEntry { prefix: &["if"], token_count: 4, function: PipeFunction::If },
    // plain key lookup; must stay last so named functions match first
    DispatchEntry { prefix: &[], token_count: 1, function: PipeFunction::PlainKey },
];

impl DispatchEntry {
    fn requires_identity(&self) -> bool {
        matches!(
            self.function,
            PipeFunction::AwsAccount | PipeFunction::AwsUser | PipeFunction::AwsArn
        )
    }
}

impl<'a> ConfigValue<'a> {
    pub(crate) fn new(config: &'a Config, raw: &'a str) -> Self {
        ConfigValue { config, raw }
    }

    /// Fully expand the raw value.
    ///
    /// Failures are annotated with the raw value for context; nested
    /// expansions annotate their own lines as the error propagates.
    pub(crate) fn evaluate(&self) -> Result<String, ConfigError> {
        self.evaluate_inner().map_err(|err| ConfigError::ExpandLine {
            message: err.to_string(),
            line: self.raw.to_string(),
        })
    }

    fn evaluate_inner(&self) -> Result<String, ConfigError> {
        let (nodes, _) = parse(self.raw, false)?;
        Ok(self.eval_nodes(&nodes, false)?.trim().to_string())
    }

    fn eval_nodes(&self, nodes: &[Node<'_>], is_placeholder: bool) -> Result<String, ConfigError> {
        let mut out = String::new();
        for node in nodes {
            match node {
                Node::Literal(text) => out.push_str(text),
                Node::Placeholder(children) => out.push_str(&self.eval_nodes(children, true)?),
            }
        }

        if is_placeholder {
            self.dispatch(&out)
        } else {
            Ok(out)
        }
    }

    fn dispatch(&self, content: &str) -> Result<String, ConfigError> {
        let tokens: Vec<String> = content.split('|').map(|token| token.trim().to_string()).collect();

        // empty or whitespace-only placeholders collapse to nothing
        if tokens.len() == 1 && tokens[0].is_empty() {
            return Ok(String::new());
        }

        let entry = self.resolve(&tokens).ok_or_else(|| {
            ConfigError::Expand(format!("unable to find matching expansion function: {content}"))
        })?;

        let args: Vec<&str> = tokens[entry.prefix.len()..]
            .iter()
            .map(String::as_str)
            .collect();

        match entry.function {
            PipeFunction::PlainKey => self.lookup_name(args[0]),
            PipeFunction::Env => env_var(args[0], args.get(1).copied()),
            PipeFunction::Uuid => self.uuid_value(args[0]),
            PipeFunction::Base64Encode => Ok(BASE64.encode(args[0].as_bytes())),
            PipeFunction::Base64Decode => base64_decode(args[0]),
            PipeFunction::Default => self.default_value(args[0], args.get(1).copied()),
            PipeFunction::Lookup => self.lookup_value(args[0], args[1], false),
            PipeFunction::LookupOptional => self.lookup_value(args[0], args[1], true),
            PipeFunction::FileText => self.file_data(args[0], false),
            PipeFunction::FileData => self.file_data(args[0], true),
            PipeFunction::FileTgz => self.tgz_file_data(args[0], args[1]),
            PipeFunction::If => self.if_condition(args[0], args[1], args.get(2).copied()),
            PipeFunction::AwsAccount => self.identity_value(IdentityField::Account, args.first().copied()),
            PipeFunction::AwsUser => self.identity_value(IdentityField::User, args.first().copied()),
            PipeFunction::AwsArn => self.identity_value(IdentityField::Arn, args.first().copied()),
        }
    }

    fn resolve(&self, tokens: &[String]) -> Option<&'static DispatchEntry> {
        DISPATCH_TABLE.iter().find(|entry| {
            entry.token_count == tokens.len()
                && (!entry.requires_identity() || self.config.identity().is_some())
                && entry.prefix.iter().zip(tokens).all(|(prefix, token)| prefix == token)
        })
    }

    fn lookup_name(&self, name: &str) -> Result<String, ConfigError> {
        if !self.config.contains(name) {
            return Err(ConfigError::Expand(format!("unknown config parameter: {name}")));
        }

        let value = self
            .config
            .get(name)?
            .unwrap_or_else(|| Value::Str(String::new()));

        value
            .render()
            .ok_or_else(|| ConfigError::Expand(format!("cannot expand non-scalar value: {name}")))
    }

    fn uuid_value(&self, name: &str) -> Result<String, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::Expand("uuid requires a name".to_string()));
        }

        Ok(self.config.get_uuid(name))
    }

    fn default_value(&self, key: &str, default: Option<&str>) -> Result<String, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::Expand("'default' parameter not set".to_string()));
        }

        let fallback = default.unwrap_or("").to_string();
        match self.lookup_name(key) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Ok(fallback),
        }
    }

    fn if_condition(&self, key: &str, then_value: &str, else_value: Option<&str>) -> Result<String, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::Expand("'if' parameter not set".to_string()));
        }

        match self.lookup_name(key) {
            Ok(value) if !value.is_empty() => Ok(then_value.to_string()),
            _ => Ok(else_value.unwrap_or("").to_string()),
        }
    }

    fn lookup_value(&self, file_name: &str, key: &str, optional: bool) -> Result<String, ConfigError> {
        let mut loaded = None;
        for full_name in get_path_names(file_name, self.config.search_paths()) {
            let Ok(text) = fs::read_to_string(&full_name) else {
                continue;
            };
            let Ok(yaml) = serde_yaml::from_str::<serde_yaml::Value>(&text) else {
                continue;
            };

            if let Some(value) = Value::from_yaml(yaml) {
                if value.is_truthy() {
                    loaded = Some(value);
                    break;
                }
            }
        }

        match loaded {
            None if optional => Ok(key.to_string()),
            None => Err(ConfigError::Expand(format!("unable to load lookup: {file_name}"))),
            Some(Value::Map(map)) => match map.get(key) {
                Some(value) => value.render().ok_or_else(|| {
                    ConfigError::Expand(format!("cannot expand non-scalar value: {key}"))
                }),
                None => Ok(key.to_string()),
            },
            Some(_) => Err(ConfigError::Expand(format!(
                "lookup file should be a mapping: {file_name}"
            ))),
        }
    }

    fn file_data(&self, file_name: &str, encode: bool) -> Result<String, ConfigError> {
        for full_name in get_path_names(file_name, self.config.search_paths()) {
            let Ok(data) = fs::read(&full_name) else {
                continue;
            };

            return if encode {
                Ok(BASE64.encode(&data))
            } else {
                String::from_utf8(data).map_err(|_| {
                    ConfigError::Expand(format!("file is not valid utf-8: '{file_name}'"))
                })
            };
        }

        Err(ConfigError::Expand(format!("unable to load file: '{file_name}'")))
    }

    fn tgz_file_data(&self, archive_name: &str, pattern_text: &str) -> Result<String, ConfigError> {
        let pattern = glob::Pattern::new(pattern_text).map_err(|err| {
            ConfigError::Expand(format!("invalid file pattern '{pattern_text}': {err}"))
        })?;

        for full_name in get_path_names(archive_name, self.config.search_paths()) {
            let Ok(file) = File::open(&full_name) else {
                continue;
            };

            let mut archive = tar::Archive::new(GzDecoder::new(file));
            let Ok(entries) = archive.entries() else {
                continue;
            };

            for entry in entries {
                let Ok(mut entry) = entry else {
                    break;
                };
                let Some(entry_name) = entry
                    .path()
                    .ok()
                    .map(|path| path.to_string_lossy().into_owned())
                else {
                    continue;
                };

                if pattern.matches(&entry_name) {
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data).map_err(|err| {
                        ConfigError::Expand(format!(
                            "unable to read archive member: tar='{archive_name}' file='{pattern_text}' error='{err}'"
                        ))
                    })?;

                    return Ok(BASE64.encode(&data));
                }
            }
        }

        Err(ConfigError::Expand(format!(
            "unable to find file: tar='{archive_name}' file='{pattern_text}'"
        )))
    }

    fn identity_value(&self, field: IdentityField, default: Option<&str>) -> Result<String, ConfigError> {
        let Some(provider) = self.config.identity() else {
            return Err(ConfigError::Expand("identity provider not available".to_string()));
        };

        match provider.lookup(field) {
            Ok(value) => Ok(value),
            Err(err) => default
                .map(str::to_string)
                .ok_or_else(|| ConfigError::Expand(err.to_string())),
        }
    }
}

fn env_var(name: &str, default: Option<&str>) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => default
            .map(str::to_string)
            .ok_or_else(|| ConfigError::Expand(format!("environment variable not found: {name}"))),
    }
}

fn base64_decode(value: &str) -> Result<String, ConfigError> {
    let data = BASE64
        .decode(value)
        .map_err(|err| ConfigError::Expand(format!("invalid base64 value: {err}")))?;

    String::from_utf8(data)
        .map_err(|_| ConfigError::Expand("decoded value is not valid utf-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityError, IdentityProvider};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const TEST_VAR_KEY: &str = "PACKERMATE_VALUE_TEST_ENV_VAR";
    const TEST_VAR_VALUE: &str = "meh";

    struct StaticIdentity;

    impl IdentityProvider for StaticIdentity {
        fn lookup(&self, field: IdentityField) -> Result<String, IdentityError> {
            Ok(match field {
                IdentityField::Account => "aws".to_string(),
                IdentityField::User => "user".to_string(),
                IdentityField::Arn => "arn".to_string(),
            })
        }
    }

    fn test_config() -> Config {
        std::env::set_var(TEST_VAR_KEY, TEST_VAR_VALUE);
        let mut config =
            Config::from_string("---\nfoo: 123\nbar: '456'\nref: foo\nempty: ''\n").unwrap();
        config.set_identity_provider(Box::new(StaticIdentity));
        config
    }

    fn expand(config: &Config, value: &str) -> Result<String, ConfigError> {
        ConfigValue::new(config, value).evaluate()
    }

    #[test]
    fn expansion_table() {
        let config = test_config();
        for (input, expected) in [
            ("", ""),
            (" ", ""),
            ("  ", ""),
            ("test", "test"),
            (" test", "test"),
            ("test ", "test"),
            ("  test  ", "test"),
            ("((foo))", "123"),
            ("(( foo))", "123"),
            ("((foo ))", "123"),
            ("(( foo ))", "123"),
            (" (( foo ))", "123"),
            ("(( foo )) ", "123"),
            ("((((ref))))", "123"),
            ("(( foo ))(( bar ))", "123456"),
            ("(( foo )) (( bar ))", "123 456"),
            ("(( foo ))  (( bar ))", "123  456"),
            ("test ((foo))", "test 123"),
            (" test ((foo))", "test 123"),
            ("test ((foo)) ", "test 123"),
            ("test  ((foo)) ", "test  123"),
            ("((foo)) test", "123 test"),
            ("((foo)) test ", "123 test"),
            ("((foo))  test", "123  test"),
            ("test ((foo)) ((bar))", "test 123 456"),
            ("test  ((foo))  ((bar))", "test  123  456"),
            ("(( ))", ""),
            ("((  ))", ""),
            ("(( default | foo ))", "123"),
            ("(( default | foo | ))", "123"),
            ("(( default | foo | bar ))", "123"),
            ("(( default | foo | (( bar )) ))", "123"),
            ("(( default | (( ref )) ))", "123"),
            ("(( default | (( ref )) | ))", "123"),
            ("(( default | (( ref )) | bar ))", "123"),
            ("(( default | (( ref )) | (( bar )) ))", "123"),
            ("(( default | empty ))", ""),
            ("(( default | empty | ))", ""),
            ("(( default | empty | bar ))", "bar"),
            ("(( default | empty | (( bar )) ))", "456"),
            ("(( default | undefined ))", ""),
            ("(( default | undefined | ))", ""),
            ("(( default | undefined | bar ))", "bar"),
            ("(( default | undefined | (( bar )) ))", "456"),
            ("(( if | foo | yes ))", "yes"),
            ("(( if | empty | yes | no ))", "no"),
            ("(( if | undefined | yes ))", ""),
            ("(( base64_encode | 123 ))", "MTIz"),
            ("(( base64_decode | (( base64_encode | 123 )) ))", "123"),
            ("(( lookup_optional | /file/does/not/exist.yml | foo ))", "foo"),
            ("(( lookup_optional | /file/does/not/exist.yml | (( foo )) ))", "123"),
            ("(( aws_account ))", "aws"),
            ("(( aws_user ))", "user"),
            ("(( aws_arn ))", "arn"),
        ] {
            assert_eq!(
                expand(&config, input).unwrap(),
                expected,
                "input: {input:?}"
            );
        }
    }

    #[test]
    fn expansion_error_table() {
        let config = test_config();
        for input in [
            "((",
            " ((",
            "(( ",
            " (( ",
            "))",
            " ))",
            ")) ",
            " )) ",
            "(( undefined ))",
            "(((( foo ))))",
            "(( | ))",
            "(( undefined | ))",
            "(( default ))",
            "(( default | ))",
            "(( default | | ))",
            "(( default | | 123 ))",
            "(( env | ))",
            "(( env | VALUE_TEST_UNDEFINED_ENV_VAR ))",
            "(( uuid | ))",
            "(( if ))",
            "(( if | | yes ))",
            "(( lookup ))",
            "(( lookup | /file/does/not/exist.yml ))",
            "(( lookup | /file/does/not/exist.yml | test ))",
        ] {
            assert!(expand(&config, input).is_err(), "input: {input:?}");
        }
    }

    #[test]
    fn expansion_errors_carry_the_raw_line() {
        let config = test_config();
        let err = expand(&config, "(( undefined ))").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unknown config parameter: undefined"));
        assert!(message.contains("line='(( undefined ))'"));
    }

    #[test]
    fn env_var_expansion() {
        let config = test_config();
        assert_eq!(
            expand(&config, &format!("(( env | {TEST_VAR_KEY} ))")).unwrap(),
            TEST_VAR_VALUE
        );
        assert_eq!(
            expand(&config, &format!("(( env | {TEST_VAR_KEY} | default ))")).unwrap(),
            TEST_VAR_VALUE
        );
        assert_eq!(
            expand(&config, "(( env | VALUE_TEST_UNDEFINED_ENV_VAR | default ))").unwrap(),
            "default"
        );
    }

    #[test]
    fn uuid_expansion_is_memoized() {
        let config = test_config();
        let a1 = expand(&config, "(( uuid | a ))").unwrap();
        let a2 = expand(&config, "(( uuid |  a  ))").unwrap();
        let b = expand(&config, "(( uuid | b ))").unwrap();

        assert!(!a1.is_empty());
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn lookup_finds_keys_in_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        let lookup_path = dir.path().join("lookup.yml");
        fs::write(&lookup_path, "abc: easy as\ndef: '123'\n").unwrap();

        let config = test_config();
        let lookup_name = lookup_path.display();

        assert_eq!(
            expand(&config, &format!("(( lookup | {lookup_name} | def ))")).unwrap(),
            "123"
        );
        assert_eq!(
            expand(&config, &format!("(( lookup_optional | {lookup_name} | def ))")).unwrap(),
            "123"
        );
        // absent keys pass through verbatim
        assert_eq!(
            expand(&config, &format!("(( lookup | {lookup_name} | missing ))")).unwrap(),
            "missing"
        );
    }

    #[test]
    fn lookup_rejects_non_mapping_files() {
        let dir = tempfile::tempdir().unwrap();
        let list_path = dir.path().join("list.yml");
        fs::write(&list_path, "- 456\n- ghi\n").unwrap();

        let config = test_config();
        for function in ["lookup", "lookup_optional"] {
            assert!(
                expand(&config, &format!("(( {function} | {} | test ))", list_path.display()))
                    .is_err()
            );
        }
    }

    #[test]
    fn file_text_and_data_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let text_path = dir.path().join("file.txt");
        fs::write(&text_path, "0123456789").unwrap();

        let data_path = dir.path().join("data.bin");
        let bytes: Vec<u8> = (0..=255).collect();
        fs::write(&data_path, &bytes).unwrap();

        let config = test_config();
        assert_eq!(
            expand(&config, &format!("(( file | text | {} ))", text_path.display())).unwrap(),
            "0123456789"
        );
        assert_eq!(
            expand(&config, &format!("(( file | data | {} ))", data_path.display())).unwrap(),
            BASE64.encode(&bytes)
        );
        assert!(expand(&config, "(( file | text | /file/does/not/exist ))").is_err());
    }

    fn write_test_archive(dir: &std::path::Path) -> std::path::PathBuf {
        let archive_path = dir.join("data.tgz");
        let file = File::create(&archive_path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(10);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "file.txt", "0123456789".as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();

        archive_path
    }

    #[test]
    fn tgz_member_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = write_test_archive(dir.path());

        let config = test_config();
        let expected = BASE64.encode("0123456789");

        for pattern in ["file.txt", "*.txt", "file.*"] {
            assert_eq!(
                expand(
                    &config,
                    &format!("(( file | tgz | {} | {pattern} ))", archive_path.display())
                )
                .unwrap(),
                expected,
                "pattern: {pattern}"
            );
        }

        assert!(expand(
            &config,
            &format!("(( file | tgz | {} | missing.* ))", archive_path.display())
        )
        .is_err());
        assert!(expand(&config, "(( file | tgz | /no/such/archive.tgz | * ))").is_err());
    }

    #[test]
    fn identity_functions_require_a_provider() {
        let config = Config::from_string("---\nfoo: 123\n").unwrap();
        // without a provider the token falls through to plain key lookup
        assert!(expand(&config, "(( aws_account ))").is_err());
    }
}
