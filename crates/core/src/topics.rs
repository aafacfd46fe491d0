// Topic layout helpers and constants matching the OpenTestbed box firmware

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub const ROOT: &str = "opentestbed";
/// MQTT single-level wildcard.
pub const WILDCARD: &str = "+";
/// Device id that asks the remote side to fan a command out to the whole fleet.
pub const BROADCAST_ID: &str = "all";
/// Placeholder name of the device id in every device-scoped template.
pub const DEVICE_FIELD: &str = "deviceId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mote,
    Box,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mote => "mote",
            DeviceType::Box => "box",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Device-scoped topics
pub fn device_root(device_type: DeviceType) -> String {
    format!("{}/deviceType/{}/deviceId", ROOT, device_type)
}

pub fn command_topic(device_type: DeviceType, device_id: &str, cmd: &str) -> String {
    format!("{}/{}/cmd/{}", device_root(device_type), device_id, cmd)
}

pub fn response_topic(device_type: DeviceType, device_id: &str, cmd: &str) -> String {
    format!("{}/{}/resp/{}", device_root(device_type), device_id, cmd)
}

pub fn response_template(device_type: DeviceType, cmd: &str) -> String {
    format!("{}/{{{}}}/resp/{}", device_root(device_type), DEVICE_FIELD, cmd)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic template is empty")]
    EmptyTemplate,
    #[error("invalid placeholder in segment '{0}'")]
    InvalidPlaceholder(String),
    #[error("wildcard segment '{0}' is not allowed in a topic template")]
    WildcardInTemplate(String),
    #[error("duplicate field '{0}' in topic template")]
    DuplicateField(String),
    #[error("field '{0}' is not part of the topic template")]
    UnknownField(String),
    #[error("missing value for field '{0}'")]
    MissingField(String),
    #[error("topic '{topic}' does not match template '{template}'")]
    MalformedTopic { topic: String, template: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

impl Segment {
    fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw == WILDCARD || raw == "#" {
            return Err(TopicError::WildcardInTemplate(raw.to_string()));
        }
        if let Some(name) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if name.is_empty() || name.contains(['{', '}']) {
                return Err(TopicError::InvalidPlaceholder(raw.to_string()));
            }
            return Ok(Segment::Field(name.to_string()));
        }
        if raw.contains(['{', '}']) {
            return Err(TopicError::InvalidPlaceholder(raw.to_string()));
        }
        Ok(Segment::Literal(raw.to_string()))
    }
}

/// A topic with named `{field}` placeholders, each spanning one whole level.
///
/// The template derives two views of itself: a subscribe form where every
/// placeholder becomes the `+` wildcard, and a matcher that recovers the
/// placeholder values from a concrete topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    template: String,
    segments: Vec<Segment>,
    subscribe_topic: String,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, TopicError> {
        if template.trim().is_empty() {
            return Err(TopicError::EmptyTemplate);
        }
        let segments = template
            .split('/')
            .map(Segment::parse)
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        for segment in &segments {
            if let Segment::Field(name) = segment {
                if !seen.insert(name.as_str()) {
                    return Err(TopicError::DuplicateField(name.clone()));
                }
            }
        }

        let subscribe_topic = segments
            .iter()
            .map(|s| match s {
                Segment::Literal(l) => l.as_str(),
                Segment::Field(_) => WILDCARD,
            })
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            template: template.to_string(),
            segments,
            subscribe_topic,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn subscribe_topic(&self) -> &str {
        &self.subscribe_topic
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitutes every placeholder with the bound value.
    pub fn render(&self, values: &[(&str, &str)]) -> Result<String, TopicError> {
        for (name, _) in values {
            if !self.fields().any(|f| f == *name) {
                return Err(TopicError::UnknownField(name.to_string()));
            }
        }
        let mut levels = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(l) => levels.push(l.as_str()),
                Segment::Field(name) => {
                    let value = values
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| *v)
                        .ok_or_else(|| TopicError::MissingField(name.clone()))?;
                    levels.push(value);
                }
            }
        }
        Ok(levels.join("/"))
    }

    pub fn matcher(&self, field: &str) -> Result<TopicMatcher, TopicError> {
        let index = self
            .segments
            .iter()
            .position(|s| matches!(s, Segment::Field(name) if name == field))
            .ok_or_else(|| TopicError::UnknownField(field.to_string()))?;
        Ok(TopicMatcher {
            template: self.clone(),
            index,
        })
    }

    fn split_matching<'t>(&self, topic: &'t str) -> Result<Vec<&'t str>, TopicError> {
        let levels: Vec<&str> = topic.split('/').collect();
        let matches = levels.len() == self.segments.len()
            && self.segments.iter().zip(&levels).all(|(segment, level)| match segment {
                Segment::Literal(l) => l == level,
                Segment::Field(_) => !level.is_empty() && *level != WILDCARD && *level != "#",
            });
        if matches {
            Ok(levels)
        } else {
            Err(TopicError::MalformedTopic {
                topic: topic.to_string(),
                template: self.template.clone(),
            })
        }
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Recovers one placeholder value from concrete topics of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatcher {
    template: TopicTemplate,
    index: usize,
}

impl TopicMatcher {
    pub fn extract(&self, topic: &str) -> Result<String, TopicError> {
        let levels = self.template.split_matching(topic)?;
        Ok(levels[self.index].to_string())
    }

    pub fn template(&self) -> &TopicTemplate {
        &self.template
    }
}

/// Compiles `template` into its subscribe form and a matcher for `device_field`.
pub fn compile(template: &str, device_field: &str) -> Result<(String, TopicMatcher), TopicError> {
    let parsed = TopicTemplate::parse(template)?;
    let matcher = parsed.matcher(device_field)?;
    Ok((parsed.subscribe_topic().to_string(), matcher))
}
