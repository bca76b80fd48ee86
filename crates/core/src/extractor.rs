use crate::models::{Attachment, DocumentDescriptor, Payload, RawAttachment};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub attachments: Vec<Attachment>,
    pub missing_links: usize,
}

pub fn extract_attachments(descriptor: &DocumentDescriptor) -> Extraction {
    let raw: Vec<&RawAttachment> = match &descriptor.payload {
        Payload::Data { original } => original.iter().collect(),
        Payload::Party { attachments } => attachments.iter().collect(),
    };

    let mut extraction = Extraction::default();
    for item in raw {
        let link = item
            .link
            .as_deref()
            .map(str::trim)
            .filter(|link| !link.is_empty());

        match link {
            Some(link) => extraction.attachments.push(Attachment {
                link: link.to_string(),
                sequence_number: item.attach_num.as_ref().map(ToString::to_string),
            }),
            None => {
                warn!(
                    document_id = %descriptor.id,
                    attach_num = ?item.attach_num,
                    "attachment has no link, skipping"
                );
                extraction.missing_links += 1;
            }
        }
    }

    extraction
}

pub fn target_name(descriptor: &DocumentDescriptor, attachment: &Attachment, position: usize) -> String {
    let document_id = sanitize_component(&descriptor.id);
    let extension = link_extension(&attachment.link);

    match descriptor.payload {
        Payload::Data { .. } => format!("{document_id}{extension}"),
        Payload::Party { .. } => {
            let sequence = attachment
                .sequence_number
                .as_deref()
                .map(sanitize_component)
                .unwrap_or_else(|| (position + 1).to_string());
            format!("{document_id}-{sequence}{extension}")
        }
    }
}

pub fn link_extension(link: &str) -> String {
    Path::new(link)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", sanitize_component(ext)))
        .unwrap_or_default()
}

fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}
