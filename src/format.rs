#![forbid(unsafe_code)]

//! Format tokens and the extraction plans they resolve to.
//!
//! A plan is the complete description of one output flavour: the argument
//! vector handed to the extractor (the source URL is appended later by the
//! process manager) plus the response headers that describe the bytes it
//! produces. Resolution is a plain map lookup, so the same token always yields
//! the same plan and an unknown token never reaches the process layer.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Result, bail};
use mime_guess::mime::Mime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_FORMAT_TOKEN: &str = "video";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Arguments shared by every built-in yt-dlp plan. `-o -` sends the media to
/// stdout, which is what the relay reads.
const YT_DLP_COMMON_ARGS: &[&str] = &["--no-playlist", "--no-progress", "--no-warnings"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unsupported format '{token}'")]
    InvalidFormat { token: String },
}

/// Concrete extraction recipe for one format token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatPlan {
    pub token: String,
    pub extraction_args: Vec<String>,
    pub content_type: String,
    pub file_ext: String,
}

impl FormatPlan {
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"stream.{}\"", self.file_ext)
    }
}

/// Operator supplied plan, read from the `[[formats]]` tables of the TOML
/// config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FormatPlanConfig {
    pub token: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub args: Vec<String>,
    pub ext: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Public description of a token for `/api/formats`. Argument vectors stay
/// server side.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    pub token: String,
    pub aliases: Vec<String>,
    pub content_type: String,
    pub file_ext: String,
}

#[derive(Debug, Clone)]
pub struct FormatResolver {
    by_token: BTreeMap<String, Arc<FormatPlan>>,
    aliases: BTreeMap<String, Vec<String>>,
}

impl FormatResolver {
    /// Resolver with the stock yt-dlp plans.
    pub fn builtin() -> Self {
        let mut resolver = Self {
            by_token: BTreeMap::new(),
            aliases: BTreeMap::new(),
        };
        resolver.insert(
            FormatPlan {
                token: "video".into(),
                extraction_args: yt_dlp_args(
                    "best[ext=mp4][vcodec^=avc1][acodec^=mp4a]/best[ext=mp4]",
                    &[],
                ),
                content_type: "video/mp4".into(),
                file_ext: "mp4".into(),
            },
            &["mp4"],
        );
        resolver.insert(
            FormatPlan {
                token: "audio".into(),
                extraction_args: yt_dlp_args("bestaudio[ext=m4a]/bestaudio[acodec^=mp4a]", &[]),
                content_type: "audio/mp4".into(),
                file_ext: "m4a".into(),
            },
            &["m4a"],
        );
        resolver.insert(
            FormatPlan {
                token: "mp3".into(),
                extraction_args: yt_dlp_args(
                    "bestaudio",
                    &[
                        "--downloader",
                        "ffmpeg",
                        "--downloader-args",
                        "ffmpeg_o:-vn -c:a libmp3lame -b:a 192k -f mp3",
                    ],
                ),
                content_type: "audio/mpeg".into(),
                file_ext: "mp3".into(),
            },
            &[],
        );
        resolver.insert(
            FormatPlan {
                token: "webm".into(),
                extraction_args: yt_dlp_args("best[ext=webm]", &[]),
                content_type: "video/webm".into(),
                file_ext: "webm".into(),
            },
            &[],
        );
        resolver
    }

    /// Built-in plans overlaid with the configured ones. A configured token
    /// (or alias) replaces whatever built-in plan used the same name.
    pub fn with_custom(custom: &[FormatPlanConfig]) -> Result<Self> {
        let mut resolver = Self::builtin();
        for entry in custom {
            let token = normalize_token(&entry.token);
            if token.is_empty() {
                bail!("format plans need a non-empty token");
            }
            let ext = entry.ext.trim().trim_start_matches('.').to_ascii_lowercase();
            if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                bail!("format '{token}' has an invalid extension '{}'", entry.ext);
            }
            if entry.args.is_empty() {
                bail!("format '{token}' has no extractor arguments");
            }
            let content_type = entry
                .content_type
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| guess_content_type(&ext));
            if content_type.parse::<Mime>().is_err() {
                bail!("format '{token}' has an invalid content type '{content_type}'");
            }
            let aliases: Vec<&str> = entry.aliases.iter().map(String::as_str).collect();
            resolver.insert(
                FormatPlan {
                    token,
                    extraction_args: entry.args.clone(),
                    content_type,
                    file_ext: ext,
                },
                &aliases,
            );
        }
        Ok(resolver)
    }

    fn insert(&mut self, plan: FormatPlan, aliases: &[&str]) {
        let plan = Arc::new(plan);
        let primary = plan.token.clone();
        let mut names = vec![primary.clone()];
        for alias in aliases.iter().map(|alias| normalize_token(alias)) {
            if !alias.is_empty() && !names.contains(&alias) {
                names.push(alias);
            }
        }

        if let Some(old_aliases) = self.aliases.remove(&primary) {
            for alias in old_aliases {
                self.by_token.remove(&alias);
            }
        }

        for name in &names {
            // Re-pointing a name away from an older plan also removes it from
            // that plan's alias list (or drops the plan when it was primary).
            if let Some(previous) = self.by_token.get(name).map(|plan| plan.token.clone())
                && previous != primary
            {
                if &previous == name {
                    if let Some(old_aliases) = self.aliases.remove(&previous) {
                        for alias in old_aliases {
                            self.by_token.remove(&alias);
                        }
                    }
                } else if let Some(old_aliases) = self.aliases.get_mut(&previous) {
                    old_aliases.retain(|alias| alias != name);
                }
            }
            self.by_token.insert(name.clone(), plan.clone());
        }
        self.aliases
            .insert(primary, names.into_iter().skip(1).collect());
    }

    pub fn resolve(&self, token: &str) -> Result<Arc<FormatPlan>, FormatError> {
        let normalized = normalize_token(token);
        self.by_token
            .get(&normalized)
            .cloned()
            .ok_or_else(|| FormatError::InvalidFormat {
                token: token.trim().to_string(),
            })
    }

    pub fn is_recognized(&self, token: &str) -> bool {
        self.by_token.contains_key(&normalize_token(token))
    }

    pub fn descriptors(&self) -> Vec<FormatDescriptor> {
        self.aliases
            .iter()
            .filter_map(|(token, aliases)| {
                let plan = self.by_token.get(token)?;
                Some(FormatDescriptor {
                    token: token.clone(),
                    aliases: aliases.clone(),
                    content_type: plan.content_type.clone(),
                    file_ext: plan.file_ext.clone(),
                })
            })
            .collect()
    }
}

fn normalize_token(token: &str) -> String {
    token.trim().to_ascii_lowercase()
}

fn yt_dlp_args(selector: &str, extra: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = YT_DLP_COMMON_ARGS.iter().map(|arg| arg.to_string()).collect();
    args.push("-f".into());
    args.push(selector.into());
    args.extend(extra.iter().map(|arg| arg.to_string()));
    args.push("-o".into());
    args.push("-".into());
    args
}

fn guess_content_type(ext: &str) -> String {
    mime_guess::from_ext(ext)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(token: &str, ext: &str, content_type: Option<&str>) -> FormatPlanConfig {
        FormatPlanConfig {
            token: token.into(),
            aliases: vec![],
            args: vec!["-f".into(), "bestaudio".into(), "-o".into(), "-".into()],
            ext: ext.into(),
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn resolve_is_deterministic_for_every_token() {
        let resolver = FormatResolver::builtin();
        for token in ["video", "mp4", "audio", "m4a", "mp3", "webm"] {
            let first = resolver.resolve(token).unwrap();
            let second = resolver.resolve(token).unwrap();
            assert_eq!(first, second, "token {token}");
            assert!(Arc::ptr_eq(&first, &second));
        }
    }

    #[test]
    fn aliases_share_a_plan() {
        let resolver = FormatResolver::builtin();
        assert_eq!(
            resolver.resolve("mp4").unwrap(),
            resolver.resolve("video").unwrap()
        );
        assert_eq!(
            resolver.resolve("m4a").unwrap(),
            resolver.resolve("audio").unwrap()
        );
    }

    #[test]
    fn tokens_are_case_and_whitespace_insensitive() {
        let resolver = FormatResolver::builtin();
        assert_eq!(resolver.resolve("  AUDIO ").unwrap().token, "audio");
    }

    #[test]
    fn unknown_and_empty_tokens_fail() {
        let resolver = FormatResolver::builtin();
        for token in ["", "   ", "flac", "video; rm -rf /", "unknown-token"] {
            let err = resolver.resolve(token).unwrap_err();
            assert!(matches!(err, FormatError::InvalidFormat { .. }), "{token}");
        }
    }

    #[test]
    fn builtin_plans_stream_to_stdout() {
        let resolver = FormatResolver::builtin();
        for descriptor in resolver.descriptors() {
            let plan = resolver.resolve(&descriptor.token).unwrap();
            let args = &plan.extraction_args;
            assert_eq!(&args[args.len() - 2..], ["-o", "-"], "{}", plan.token);
        }
    }

    #[test]
    fn audio_and_video_headers() {
        let resolver = FormatResolver::builtin();
        let audio = resolver.resolve("audio").unwrap();
        assert_eq!(audio.content_type, "audio/mp4");
        assert_eq!(
            audio.content_disposition(),
            "attachment; filename=\"stream.m4a\""
        );
        let video = resolver.resolve("video").unwrap();
        assert_eq!(video.content_type, "video/mp4");
        assert_eq!(
            video.content_disposition(),
            "attachment; filename=\"stream.mp4\""
        );
    }

    #[test]
    fn custom_plan_guesses_content_type() {
        let resolver = FormatResolver::with_custom(&[custom("flac", ".FLAC", None)]).unwrap();
        let plan = resolver.resolve("flac").unwrap();
        assert_eq!(plan.file_ext, "flac");
        assert!(plan.content_type.starts_with("audio/"));
    }

    #[test]
    fn custom_plan_unknown_extension_falls_back() {
        let resolver = FormatResolver::with_custom(&[custom("raw", "zzqq", None)]).unwrap();
        assert_eq!(
            resolver.resolve("raw").unwrap().content_type,
            FALLBACK_CONTENT_TYPE
        );
    }

    #[test]
    fn custom_plan_replaces_builtin_alias() {
        let mut entry = custom("opus", "opus", Some("audio/ogg"));
        entry.aliases = vec!["m4a".into()];
        let resolver = FormatResolver::with_custom(&[entry]).unwrap();
        assert_eq!(resolver.resolve("m4a").unwrap().token, "opus");
        assert_eq!(resolver.resolve("audio").unwrap().token, "audio");
        let audio = resolver
            .descriptors()
            .into_iter()
            .find(|descriptor| descriptor.token == "audio")
            .unwrap();
        assert!(audio.aliases.is_empty());
    }

    #[test]
    fn custom_plan_replaces_builtin_token() {
        let resolver =
            FormatResolver::with_custom(&[custom("video", "mkv", Some("video/x-matroska"))])
                .unwrap();
        assert_eq!(resolver.resolve("video").unwrap().file_ext, "mkv");
        assert!(!resolver.is_recognized("mp4"));
    }

    #[test]
    fn custom_plan_validation() {
        assert!(FormatResolver::with_custom(&[custom(" ", "mp3", None)]).is_err());
        assert!(FormatResolver::with_custom(&[custom("x", "", None)]).is_err());
        assert!(FormatResolver::with_custom(&[custom("x", "a/b", None)]).is_err());
        assert!(FormatResolver::with_custom(&[custom("x", "mp3", Some("not a mime"))]).is_err());
        let mut no_args = custom("x", "mp3", None);
        no_args.args.clear();
        assert!(FormatResolver::with_custom(&[no_args]).is_err());
    }

    #[test]
    fn descriptors_list_primary_tokens() {
        let tokens: Vec<String> = FormatResolver::builtin()
            .descriptors()
            .into_iter()
            .map(|descriptor| descriptor.token)
            .collect();
        assert_eq!(tokens, ["audio", "mp3", "video", "webm"]);
    }
}
