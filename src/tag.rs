//! Tag expressions: the declarative "this file is produced by this action"
//! notation used in file-valued positions of the task description.
//!
//! Every tag names exactly one action kind out of a closed set, carries an
//! ordered argument list, and produces exactly one output artifact when
//! compiled and executed. Nested tags are ordinary arguments: the inner tag
//! is compiled first and its output becomes an input of the outer node.

use serde_yaml::Value;

use crate::error::ConfigError;

/// The closed set of action kinds a tag can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    LatexCompile,
    CppCompile,
    CppRun,
    Shell,
    PyRun,
    Raw,
    PyInline,
    Zip,
    MdCompile,
    Gunzip,
    XzUnzip,
}

impl TagKind {
    pub fn name(self) -> &'static str {
        match self {
            TagKind::LatexCompile => "latexcompile",
            TagKind::CppCompile => "cppcompile",
            TagKind::CppRun => "cpprun",
            TagKind::Shell => "shell",
            TagKind::PyRun => "pyrun",
            TagKind::Raw => "raw",
            TagKind::PyInline => "pyinline",
            TagKind::Zip => "zip",
            TagKind::MdCompile => "mdcompile",
            TagKind::Gunzip => "gunzip",
            TagKind::XzUnzip => "xzunzip",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "latexcompile" => TagKind::LatexCompile,
            "cppcompile" => TagKind::CppCompile,
            "cpprun" => TagKind::CppRun,
            "shell" => TagKind::Shell,
            "pyrun" => TagKind::PyRun,
            "raw" => TagKind::Raw,
            "pyinline" => TagKind::PyInline,
            "zip" => TagKind::Zip,
            "mdcompile" => TagKind::MdCompile,
            "gunzip" => TagKind::Gunzip,
            "xzunzip" => TagKind::XzUnzip,
            _ => return None,
        })
    }

    /// `!raw` and `!pyinline` hold verbatim text; every other kind splits a
    /// scalar value shell-style into individual arguments.
    fn splits_scalar(self) -> bool {
        !matches!(self, TagKind::Raw | TagKind::PyInline)
    }
}

/// One argument of a tag expression. Whether a string argument is a literal,
/// a concrete path or a wildcard pattern is decided by the graph compiler,
/// which knows the task root and the argument conventions of each kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TagArg {
    Str(String),
    Tag(Box<Tag>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub kind: TagKind,
    pub args: Vec<TagArg>,
}

impl Tag {
    /// Parse a YAML `!tag` value. Accepts a scalar (split shell-style except
    /// for the verbatim kinds) or a sequence whose items are strings,
    /// numbers or nested tags.
    pub(crate) fn from_tagged(tag: &str, value: &Value, field: &str) -> Result<Tag, ConfigError> {
        let name = tag.trim_start_matches('!');
        let kind = TagKind::from_name(name).ok_or_else(|| ConfigError::UnknownTag {
            field: field.to_string(),
            tag: name.to_string(),
        })?;

        let args = match value {
            Value::String(text) => {
                if kind.splits_scalar() {
                    let words = shlex::split(text).ok_or_else(|| ConfigError::Invalid {
                        field: field.to_string(),
                        reason: format!("unbalanced quoting in `!{name} {text}`"),
                    })?;
                    words.into_iter().map(TagArg::Str).collect()
                } else {
                    vec![TagArg::Str(text.clone())]
                }
            }
            Value::Sequence(items) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    args.push(match item {
                        Value::String(s) => TagArg::Str(s.clone()),
                        Value::Number(n) => TagArg::Str(n.to_string()),
                        Value::Tagged(inner) => TagArg::Tag(Box::new(Tag::from_tagged(
                            &inner.tag.to_string(),
                            &inner.value,
                            field,
                        )?)),
                        other => {
                            return Err(ConfigError::Invalid {
                                field: field.to_string(),
                                reason: format!(
                                    "`!{name}` arguments must be strings or tags, got {other:?}"
                                ),
                            });
                        }
                    });
                }
                args
            }
            other => {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: format!("`!{name}` expects a string or a sequence, got {other:?}"),
                });
            }
        };

        let tag = Tag { kind, args };
        tag.check_arity(field)?;
        Ok(tag)
    }

    fn check_arity(&self, field: &str) -> Result<(), ConfigError> {
        let expected = match self.kind {
            TagKind::LatexCompile
            | TagKind::MdCompile
            | TagKind::Gunzip
            | TagKind::XzUnzip
            | TagKind::Raw
            | TagKind::PyInline => Some(1),
            _ => None,
        };

        match expected {
            Some(n) if self.args.len() != n => Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: format!(
                    "`!{}` takes exactly {n} argument(s), got {}",
                    self.kind.name(),
                    self.args.len()
                ),
            }),
            _ if self.args.is_empty() => Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: format!("`!{}` needs at least one argument", self.kind.name()),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn tag_of(text: &str) -> Tag {
        match yaml(text) {
            Value::Tagged(tagged) => {
                Tag::from_tagged(&tagged.tag.to_string(), &tagged.value, "test").unwrap()
            }
            other => panic!("expected tagged value, got {other:?}"),
        }
    }

    #[test]
    fn scalar_splits_shell_style() {
        let tag = tag_of(r#"!cppcompile "gen.cpp -DLOCAL 'my file.h'""#);
        assert_eq!(tag.kind, TagKind::CppCompile);
        assert_eq!(
            tag.args,
            vec![
                TagArg::Str("gen.cpp".into()),
                TagArg::Str("-DLOCAL".into()),
                TagArg::Str("my file.h".into()),
            ]
        );
    }

    #[test]
    fn raw_keeps_text_verbatim() {
        let tag = tag_of("!raw \"1 2  3\\n\"");
        assert_eq!(tag.args, vec![TagArg::Str("1 2  3\n".into())]);
    }

    #[test]
    fn sequence_allows_nested_tags() {
        let tag = tag_of(r#"!zip ["data.txt", !cppcompile "sol.cpp"]"#);
        assert_eq!(tag.kind, TagKind::Zip);
        assert_eq!(tag.args.len(), 2);
        match &tag.args[1] {
            TagArg::Tag(inner) => assert_eq!(inner.kind, TagKind::CppCompile),
            other => panic!("expected nested tag, got {other:?}"),
        }
    }

    #[test]
    fn numbers_become_string_arguments() {
        let tag = tag_of(r#"!pyrun ["gen.py", 42]"#);
        assert_eq!(
            tag.args,
            vec![TagArg::Str("gen.py".into()), TagArg::Str("42".into())]
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let value = yaml("!frobnicate x");
        let Value::Tagged(tagged) = value else {
            unreachable!()
        };
        let err = Tag::from_tagged(&tagged.tag.to_string(), &tagged.value, "statements.en");
        assert!(matches!(err, Err(ConfigError::UnknownTag { tag, .. }) if tag == "frobnicate"));
    }

    #[test]
    fn arity_is_enforced() {
        let value = yaml("!gunzip \"a.gz b.gz\"");
        let Value::Tagged(tagged) = value else {
            unreachable!()
        };
        let err = Tag::from_tagged(&tagged.tag.to_string(), &tagged.value, "input");
        assert!(matches!(err, Err(ConfigError::Invalid { .. })));
    }
}
