//! Path-based scope rules.
//!
//! A rule document is a JSON array of rules. Each rule has an optional list
//! of segment matchers and an action; matcher fields are either blank (match
//! anything), a `/regex/`, or a case-insensitive substring:
//!
//! ```json
//! [
//!   { "path": [ { "typeName": "UnityEngine." } ], "action": "Reject" },
//!   { "path": [ { "method": "get_voicePitch" },
//!               { "pathKind": "/(EntryBlock|SubBlock)/" } ], "action": "Accept" },
//!   { "path": [ { "assembly": "/^(Assembly-CSharp|ILGLib|IL)\\.dll$/" } ] },
//!   { "path": [], "action": "Exclude" }
//! ]
//! ```
//!
//! Documents are compiled once into a [`RuleSet`]; the `/.../` convention is
//! resolved at that point, not per match.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::path::{BlockPath, PathKind, PathSegment};

use md5::{Digest, Md5};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reference text written next to the default rule files.
pub const RULES_README: &str = "Changes to *.default.json will not persist.\n\
Create pre_filter.json and/or filter.json to override default filter rules in *.default.json.\n";

/// What a matching rule decides.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    /// Vote this path in scope.
    #[default]
    Include,
    /// Vote this path out of scope.
    Exclude,
    /// The whole site is in scope, regardless of other paths.
    Accept,
    /// The whole site is out of scope, regardless of other paths.
    Reject,
}

/// Matcher for one path segment, as written in a rule document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherDoc {
    #[serde(default, alias = "PathKind", skip_serializing_if = "Option::is_none")]
    pub path_kind: Option<String>,
    #[serde(default, alias = "Assembly", skip_serializing_if = "Option::is_none")]
    pub assembly: Option<String>,
    #[serde(default, alias = "TypeName", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, alias = "Method", skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, alias = "SubIndex", skip_serializing_if = "Option::is_none")]
    pub sub_index: Option<String>,
    #[serde(default, alias = "BlockIndex", skip_serializing_if = "Option::is_none")]
    pub block_index: Option<String>,
}

/// One rule as written in a rule document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDoc {
    /// `None` matches every path; `Some(vec![])` does too.
    #[serde(default, alias = "Path", skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<MatcherDoc>>,
    #[serde(default, alias = "Action")]
    pub action: RuleAction,
}

/// A compiled field pattern.
#[derive(Clone, Debug)]
pub enum Pattern {
    Any,
    /// Lowercased needle.
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    /// Compile a field. Blank text matches anything; `/.../` is a regex.
    /// Literals always ignore case; regexes only when `ignore_case` is set.
    pub fn parse(text: Option<&str>, ignore_case: bool) -> Result<Self> {
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            return Ok(Pattern::Any);
        };

        if text.len() >= 2 && text.starts_with('/') && text.ends_with('/') {
            let pattern = &text[1..text.len() - 1];
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(ignore_case)
                .build()
                .map_err(|source| Error::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                })?;
            return Ok(Pattern::Regex(regex));
        }

        Ok(Pattern::Literal(text.to_lowercase()))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Pattern::Any)
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Literal(needle) => value.to_lowercase().contains(needle.as_str()),
            Pattern::Regex(regex) => regex.is_match(value),
        }
    }
}

/// Compiled matcher for one path segment.
#[derive(Clone, Debug)]
pub struct SegmentMatcher {
    kind: Pattern,
    assembly: Pattern,
    type_name: Pattern,
    method: Pattern,
    sub_index: Pattern,
    block_index: Pattern,
}

impl SegmentMatcher {
    pub fn compile(doc: &MatcherDoc) -> Result<Self> {
        Ok(Self {
            kind: Pattern::parse(doc.path_kind.as_deref(), true)?,
            assembly: Pattern::parse(doc.assembly.as_deref(), false)?,
            type_name: Pattern::parse(doc.type_name.as_deref(), false)?,
            method: Pattern::parse(doc.method.as_deref(), false)?,
            sub_index: Pattern::parse(doc.sub_index.as_deref(), false)?,
            block_index: Pattern::parse(doc.block_index.as_deref(), false)?,
        })
    }

    pub fn matches(&self, segment: &PathSegment) -> bool {
        let kind = segment.kind();
        if !self.kind.matches(kind.as_str()) {
            return false;
        }

        let index_ok = match (kind, segment.index()) {
            (PathKind::EntryBlock | PathKind::SubBlock, Some(index)) => {
                self.block_index.matches(&index.to_string())
            }
            (PathKind::SubFunction, Some(index)) => self.sub_index.matches(&index.to_string()),
            _ => self.block_index.is_any() && self.sub_index.is_any(),
        };
        if !index_ok {
            return false;
        }

        if self.assembly.is_any() && self.type_name.is_any() && self.method.is_any() {
            return true;
        }

        segment.methods().iter().any(|m| {
            self.assembly.matches(&m.assembly)
                && self.type_name.matches(&m.type_name)
                && self.method.matches(&m.name)
        })
    }
}

/// A compiled rule.
#[derive(Clone, Debug)]
pub struct Rule {
    matchers: Option<Vec<SegmentMatcher>>,
    action: RuleAction,
}

impl Rule {
    pub fn compile(doc: &RuleDoc) -> Result<Self> {
        let matchers = match &doc.path {
            Some(path) => Some(
                path.iter()
                    .map(SegmentMatcher::compile)
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };
        Ok(Self {
            matchers,
            action: doc.action,
        })
    }

    pub fn action(&self) -> RuleAction {
        self.action
    }

    /// Positional prefix match: matcher `i` against segment `i`.
    pub fn matches(&self, path: &BlockPath) -> bool {
        let Some(matchers) = &self.matchers else {
            return true;
        };
        matchers.len() <= path.len()
            && matchers
                .iter()
                .zip(path.segments())
                .all(|(matcher, segment)| matcher.matches(segment))
    }
}

/// Ordered rule list.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_docs(docs: &[RuleDoc]) -> Result<Self> {
        let rules = docs.iter().map(Rule::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Parse and compile a JSON rule document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let docs: Vec<RuleDoc> = serde_json::from_slice(bytes).map_err(Error::RuleDocument)?;
        Self::from_docs(&docs)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decide whether a site reached through `paths` is in scope.
    ///
    /// For each path the first matching rule acts: Accept or Reject settles the
    /// site immediately, Include or Exclude votes for that path only. Without
    /// an Accept or Reject, the site is in scope iff some path voted Include.
    pub fn is_in_scope<'p, I>(&self, paths: I) -> bool
    where
        I: IntoIterator<Item = &'p BlockPath>,
    {
        let mut included = false;

        for path in paths {
            let Some(rule) = self.rules.iter().find(|rule| rule.matches(path)) else {
                continue;
            };
            match rule.action {
                RuleAction::Include => included = true,
                RuleAction::Exclude => {}
                RuleAction::Accept => return true,
                RuleAction::Reject => return false,
            }
        }

        included
    }

    /// Load the override at `rules_path`, falling back to `defaults`.
    ///
    /// `defaults` are always written to `default_path` for reference. The
    /// returned hash is the uppercase hex MD5 of the document actually used.
    pub fn load_or_default(
        rules_path: &Path,
        default_path: &Path,
        defaults: &[RuleDoc],
    ) -> Result<LoadedRules> {
        let default_text = serde_json::to_vec_pretty(defaults).map_err(Error::RuleDocument)?;

        if let Some(dir) = default_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(default_path, &default_text)?;

        match fs::read(rules_path) {
            Ok(text) => match Self::from_json(&text) {
                Ok(rules) => {
                    debug!("loaded {} rules from {}", rules.len(), rules_path.display());
                    return Ok(LoadedRules {
                        rules,
                        hash: md5_upper_hex(&text),
                        from_override: true,
                    });
                }
                Err(e) => warn!("ignoring {}: {}", rules_path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot read {}: {}", rules_path.display(), e),
        }

        Ok(LoadedRules {
            rules: Self::from_docs(defaults)?,
            hash: md5_upper_hex(&default_text),
            from_override: false,
        })
    }
}

/// A rule set plus the hash that identifies it in cache keys.
#[derive(Clone, Debug)]
pub struct LoadedRules {
    pub rules: RuleSet,
    pub hash: String,
    pub from_override: bool,
}

pub(crate) fn md5_upper_hex(bytes: &[u8]) -> String {
    hex::encode_upper(Md5::digest(bytes))
}

fn segment(f: impl FnOnce(&mut MatcherDoc)) -> MatcherDoc {
    let mut doc = MatcherDoc::default();
    f(&mut doc);
    doc
}

fn rule(action: RuleAction, path: Vec<MatcherDoc>) -> RuleDoc {
    RuleDoc {
        path: Some(path),
        action,
    }
}

/// Keep methods declared in the game's own assemblies, skip everything else.
pub fn default_pre_filter_rules() -> Vec<RuleDoc> {
    vec![
        rule(
            RuleAction::Include,
            vec![segment(|m| {
                m.assembly = Some(r"/^(Assembly-CSharp|ILGLib|IL)\.dll$/".into())
            })],
        ),
        rule(RuleAction::Exclude, vec![]),
    ]
}

/// Curated scope for clamp sites, followed by the pre-filter rules.
pub fn default_filter_rules() -> Vec<RuleDoc> {
    use RuleAction::*;

    let mut rules = vec![
        rule(Reject, vec![segment(|m| m.type_name = Some("UnityEngine.".into()))]),
        rule(
            Reject,
            vec![
                segment(|m| {
                    m.type_name = Some("TypefaceAnimator".into());
                    m.method = Some("Modify".into());
                }),
                segment(|m| m.path_kind = Some("SubFunction".into())),
                segment(|m| m.path_kind = Some("EntryBlock".into())),
            ],
        ),
        rule(
            Reject,
            vec![
                segment(|m| {
                    m.type_name = Some("Character.HumanFace".into());
                    m.method = Some("UpdateBlendShapeVoice".into());
                }),
                segment(|m| m.path_kind = Some("SubFunction".into())),
                segment(|m| m.path_kind = Some("EntryBlock".into())),
            ],
        ),
        rule(
            Accept,
            vec![
                segment(|m| m.method = Some("get_voicePitch".into())),
                segment(|m| m.path_kind = Some("/(EntryBlock|SubBlock)/".into())),
            ],
        ),
        rule(
            Exclude,
            vec![segment(|m| m.type_name = Some("Character.HumanFace".into()))],
        ),
        rule(
            Include,
            vec![segment(|m| {
                m.type_name =
                    Some("/(Character.Human|HumanCustom|EyeLookMaterialControll|VoiceCtrl)/".into())
            })],
        ),
        rule(
            Exclude,
            vec![segment(|m| m.type_name = Some("SV.H.HScene/AnimeSpeeder".into()))],
        ),
        rule(
            Exclude,
            vec![segment(|m| {
                m.type_name = Some(r"/(^|\.)H\./".into());
                m.method = Some("/SetAnimationParam(e|a)ter/".into());
            })],
        ),
        rule(
            Exclude,
            vec![segment(|m| {
                m.type_name = Some(
                    concat!(
                        r"/(^(AC|SV|HC|DigitalCraft)\.|(^|\.)(H|ADV)\.|\.FBS|ColorPicker|",
                        r"EyeLookCalc|NeckLookCalc|NeckLookController|Color|Fade|Camera|Blink|",
                        r"Mouth|AnimationControllerBase|InertialAnimator|BaseCameraControl|",
                        r"BoneSwayCtr|PopupMsg|InteractableAlphaChanger|MatAnm|TexAnm|Morph|",
                        r"Rigging|MotionIK|OverrideCursor|SlicedFilledImage|CaptureFrame|",
                        r"CustomWindowDragMove|StateMiniSelection|StateSetting|CustomImage|",
                        r"MoveWindow|ImageCustom|Manager\.|ScreenshotHandlerURP)/",
                    )
                    .into(),
                )
            })],
        ),
        rule(
            Exclude,
            vec![segment(|m| {
                m.type_name = Some(
                    concat!(
                        r"/^(DynamicBone|SuperScrollView|KriptoFX|Funly|ARYKEI|SensorToolkit|",
                        r"RuntimeMeshSimplifier|AmplifyColor|CFX_|SmoothCameraOrbit|",
                        r"ImplicitSurface|IncrementalModeling|MetaballBuilder|LakePolygon|",
                        r"MeshColoringRam|RamSpline|BFX_|EMTransition|MatAnmFrame|TexAnmUV)/",
                    )
                    .into(),
                )
            })],
        ),
    ];
    rules.extend(default_pre_filter_rules());
    rules
}
