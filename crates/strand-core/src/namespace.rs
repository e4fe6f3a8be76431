//! Stream naming: building names for requests and classifying names of
//! received data.
//!
//! ```text
//! data     <base…>/ndnrtc/%FD<api>/<audio|video>/<stream>/<thread>/<delta|key>/%FE<sample>/%00<seg>
//! parity   <base…>/ndnrtc/%FD<api>/<audio|video>/<stream>/<thread>/<delta|key>/%FE<sample>/%00<seg>/parity
//! manifest <base…>/ndnrtc/%FD<api>/<audio|video>/<stream>/<thread>/<delta|key>/%FE<sample>/_manifest
//! t-meta   <base…>/ndnrtc/%FD<api>/<audio|video>/<stream>/<thread>/meta/%FD<version>/%00<seg>
//! s-meta   <base…>/ndnrtc/%FD<api>/<audio|video>/<stream>/meta/%FD<version>/%00<seg>
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::name::{segment_of, sequence_of, version_of, Name, NameError};

pub const APP_COMPONENT: &str = "ndnrtc";
pub const API_VERSION: u64 = 3;

pub const AUDIO_COMPONENT: &str = "audio";
pub const VIDEO_COMPONENT: &str = "video";
pub const META_COMPONENT: &str = "meta";
pub const DELTA_COMPONENT: &str = "delta";
pub const KEY_COMPONENT: &str = "key";
pub const PARITY_COMPONENT: &str = "parity";
pub const MANIFEST_COMPONENT: &str = "_manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
}

impl StreamType {
    pub fn component(self) -> &'static str {
        match self {
            StreamType::Audio => AUDIO_COMPONENT,
            StreamType::Video => VIDEO_COMPONENT,
        }
    }

    fn from_component(c: &str) -> Option<Self> {
        match c {
            AUDIO_COMPONENT => Some(StreamType::Audio),
            VIDEO_COMPONENT => Some(StreamType::Video),
            _ => None,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.component())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleClass {
    Unknown,
    Key,
    Delta,
}

impl SampleClass {
    pub fn component(self) -> Option<&'static str> {
        match self {
            SampleClass::Key => Some(KEY_COMPONENT),
            SampleClass::Delta => Some(DELTA_COMPONENT),
            SampleClass::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        self != SampleClass::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentClass {
    Unknown,
    Data,
    Parity,
    Manifest,
    Meta,
}

/// Everything a name says about the data it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
    pub base_prefix: Name,
    pub api_version: u64,
    pub stream_type: StreamType,
    pub stream_name: String,
    /// Empty for stream meta.
    pub thread_name: String,
    pub is_meta: bool,
    pub meta_version: u64,
    pub sample_class: SampleClass,
    pub segment_class: SegmentClass,
    pub sample_no: u64,
    pub segment_no: u64,
}

impl NamespaceInfo {
    /// Classify a fully qualified segment name.
    pub fn classify(name: &Name) -> Result<Self, NameError> {
        let malformed = |reason| NameError::Malformed {
            name: name.to_string(),
            reason,
        };

        // The last app component followed by a version; the base prefix
        // may itself contain an "ndnrtc" component.
        let app_idx = (0..name.len())
            .rev()
            .find(|&i| {
                name.get(i) == Some(APP_COMPONENT)
                    && name.get(i + 1).and_then(version_of).is_some()
            })
            .ok_or_else(|| NameError::NotStreamName(name.to_string()))?;

        let api_version = name
            .get(app_idx + 1)
            .and_then(version_of)
            .ok_or_else(|| malformed("missing api version"))?;
        let rest: Vec<&str> = name.components().skip(app_idx + 2).collect();

        let stream_type = rest
            .first()
            .and_then(|c| StreamType::from_component(c))
            .ok_or_else(|| malformed("unknown stream type"))?;
        let stream_name = rest
            .get(1)
            .ok_or_else(|| malformed("missing stream name"))?
            .to_string();

        let mut info = NamespaceInfo {
            base_prefix: name.prefix(app_idx),
            api_version,
            stream_type,
            stream_name,
            thread_name: String::new(),
            is_meta: false,
            meta_version: 0,
            sample_class: SampleClass::Unknown,
            segment_class: SegmentClass::Unknown,
            sample_no: 0,
            segment_no: 0,
        };

        // Stream meta.
        if rest.get(2) == Some(&META_COMPONENT) {
            if rest.len() != 5 {
                return Err(malformed("stream meta needs version and segment"));
            }
            info.is_meta = true;
            info.segment_class = SegmentClass::Meta;
            info.meta_version = version_of(rest[3]).ok_or_else(|| malformed("bad meta version"))?;
            info.segment_no = segment_of(rest[4]).ok_or_else(|| malformed("bad segment number"))?;
            return Ok(info);
        }

        info.thread_name = rest
            .get(2)
            .ok_or_else(|| malformed("missing thread name"))?
            .to_string();

        match rest.get(3).copied() {
            Some(META_COMPONENT) => {
                if rest.len() != 6 {
                    return Err(malformed("thread meta needs version and segment"));
                }
                info.is_meta = true;
                info.segment_class = SegmentClass::Meta;
                info.meta_version =
                    version_of(rest[4]).ok_or_else(|| malformed("bad meta version"))?;
                info.segment_no =
                    segment_of(rest[5]).ok_or_else(|| malformed("bad segment number"))?;
            }
            Some(class @ (DELTA_COMPONENT | KEY_COMPONENT)) => {
                info.sample_class = if class == KEY_COMPONENT {
                    SampleClass::Key
                } else {
                    SampleClass::Delta
                };
                if stream_type == StreamType::Audio && info.sample_class == SampleClass::Key {
                    return Err(malformed("audio has no key samples"));
                }
                info.sample_no = rest
                    .get(4)
                    .and_then(|c| sequence_of(c))
                    .ok_or_else(|| malformed("bad sample number"))?;

                match (rest.get(5).copied(), rest.len()) {
                    (Some(MANIFEST_COMPONENT), 6) => {
                        info.segment_class = SegmentClass::Manifest;
                    }
                    (Some(seg), 6) => {
                        info.segment_no = segment_of(seg).ok_or_else(|| malformed("bad segment number"))?;
                        info.segment_class = SegmentClass::Data;
                    }
                    (Some(seg), 7) if rest[6] == PARITY_COMPONENT => {
                        info.segment_no = segment_of(seg).ok_or_else(|| malformed("bad segment number"))?;
                        info.segment_class = SegmentClass::Parity;
                    }
                    _ => return Err(malformed("unrecognised segment suffix")),
                }
            }
            _ => return Err(malformed("expected meta, delta or key")),
        }

        Ok(info)
    }

    pub fn is_parity(&self) -> bool {
        self.segment_class == SegmentClass::Parity
    }

    pub fn is_delta(&self) -> bool {
        self.sample_class == SampleClass::Delta
    }

    /// Rebuild the name this info was classified from.
    pub fn name(&self) -> Name {
        let ns = StreamNamespace::with_api(
            self.base_prefix.clone(),
            self.api_version,
            self.stream_type,
            &self.stream_name,
        );
        match self.segment_class {
            SegmentClass::Meta if self.thread_name.is_empty() => {
                ns.stream_meta(self.meta_version, self.segment_no)
            }
            SegmentClass::Meta => ns.thread_meta(&self.thread_name, self.meta_version, self.segment_no),
            SegmentClass::Manifest => ns.manifest(&self.thread_name, self.sample_class, self.sample_no),
            SegmentClass::Parity => {
                ns.parity(&self.thread_name, self.sample_class, self.sample_no, self.segment_no)
            }
            SegmentClass::Data | SegmentClass::Unknown => {
                ns.segment(&self.thread_name, self.sample_class, self.sample_no, self.segment_no)
            }
        }
    }
}

/// Builds names under one stream's prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNamespace {
    base: Name,
    api_version: u64,
    stream_type: StreamType,
    stream_name: String,
}

impl StreamNamespace {
    pub fn new(base: Name, stream_type: StreamType, stream_name: &str) -> Self {
        Self::with_api(base, API_VERSION, stream_type, stream_name)
    }

    pub fn with_api(base: Name, api_version: u64, stream_type: StreamType, stream_name: &str) -> Self {
        Self {
            base,
            api_version,
            stream_type,
            stream_name: stream_name.to_string(),
        }
    }

    /// Parse `<base…>/ndnrtc/%FD<api>/<type>/<stream>`.
    pub fn from_prefix(prefix: &Name) -> Result<Self, NameError> {
        let malformed = |reason| NameError::Malformed {
            name: prefix.to_string(),
            reason,
        };
        let len = prefix.len();
        if len < 4 {
            return Err(NameError::NotStreamName(prefix.to_string()));
        }
        if prefix.get(len - 4) != Some(APP_COMPONENT) {
            return Err(NameError::NotStreamName(prefix.to_string()));
        }
        let api_version = prefix
            .get(len - 3)
            .and_then(version_of)
            .ok_or_else(|| malformed("missing api version"))?;
        let stream_type = prefix
            .get(len - 2)
            .and_then(StreamType::from_component)
            .ok_or_else(|| malformed("unknown stream type"))?;
        let stream_name = prefix
            .get(len - 1)
            .ok_or_else(|| malformed("missing stream name"))?;
        Ok(Self::with_api(prefix.prefix(len - 4), api_version, stream_type, stream_name))
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn base(&self) -> &Name {
        &self.base
    }

    pub fn stream_prefix(&self) -> Name {
        self.base
            .clone()
            .append(APP_COMPONENT)
            .append_version(self.api_version)
            .append(self.stream_type.component())
            .append(self.stream_name.as_str())
    }

    pub fn thread_prefix(&self, thread: &str) -> Name {
        self.stream_prefix().append(thread)
    }

    /// Prefix of one sample. `Unknown` class maps to delta.
    pub fn sample_prefix(&self, thread: &str, class: SampleClass, sample_no: u64) -> Name {
        self.thread_prefix(thread)
            .append(class.component().unwrap_or(DELTA_COMPONENT))
            .append_sequence(sample_no)
    }

    pub fn segment(&self, thread: &str, class: SampleClass, sample_no: u64, seg: u64) -> Name {
        self.sample_prefix(thread, class, sample_no).append_segment(seg)
    }

    pub fn parity(&self, thread: &str, class: SampleClass, sample_no: u64, seg: u64) -> Name {
        self.segment(thread, class, sample_no, seg)
            .append(PARITY_COMPONENT)
    }

    pub fn manifest(&self, thread: &str, class: SampleClass, sample_no: u64) -> Name {
        self.sample_prefix(thread, class, sample_no)
            .append(MANIFEST_COMPONENT)
    }

    /// Prefix fetched with `can_be_prefix` to discover the latest thread meta.
    pub fn thread_meta_prefix(&self, thread: &str) -> Name {
        self.thread_prefix(thread).append(META_COMPONENT)
    }

    pub fn thread_meta(&self, thread: &str, version: u64, seg: u64) -> Name {
        self.thread_meta_prefix(thread)
            .append_version(version)
            .append_segment(seg)
    }

    pub fn stream_meta_prefix(&self) -> Name {
        self.stream_prefix().append(META_COMPONENT)
    }

    pub fn stream_meta(&self, version: u64, seg: u64) -> Name {
        self.stream_meta_prefix()
            .append_version(version)
            .append_segment(seg)
    }
}
