//! Message envelopes and their field layout

use bytes::Bytes;

use rivulet_common::types::{Fields, BODY_FIELD};

/// Unit of published data: an encoded body plus ordered tags
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    body: Option<Bytes>,
    tags: Vec<(String, String)>,
}

impl Envelope {
    /// Envelope carrying an already encoded body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: Some(body.into()),
            tags: Vec::new(),
        }
    }

    /// Envelope carrying tags only
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: &[(&str, &str)]) -> Self {
        self.tags
            .extend(tags.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())));
        self
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Wire layout: `s` holds the body, tags follow in caller order
    pub fn into_fields(self) -> Fields {
        let mut fields = Vec::with_capacity(self.tags.len() + 1);
        if let Some(body) = self.body {
            fields.push((BODY_FIELD.to_string(), body));
        }
        fields.extend(self.tags.into_iter().map(|(k, v)| (k, Bytes::from(v))));
        fields
    }
}
