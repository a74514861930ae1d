//! Activity type hierarchy
//!
//! Inbox listeners are registered per activity type IRI and dispatched to the
//! most specific registered ancestor. The hierarchy is the ActivityStreams
//! vocabulary one, flattened into a static supertype table keyed by IRI.

/// The ActivityStreams namespace.
pub const AS_NAMESPACE: &str = "https://www.w3.org/ns/activitystreams#";

/// Expand a compacted type tag (`Create`) into a full IRI. Tags that already
/// look absolute are returned unchanged.
pub fn expand_type(tag: &str) -> String {
    if tag.contains(':') {
        tag.to_string()
    } else {
        format!("{AS_NAMESPACE}{tag}")
    }
}

/// Direct supertype of an activity type IRI, if it has one.
pub fn supertype(type_iri: &str) -> Option<&'static str> {
    let name = type_iri.strip_prefix(AS_NAMESPACE)?;
    let parent = match name {
        "Accept" | "Add" | "Announce" | "Create" | "Delete" | "Dislike" | "Flag" | "Follow"
        | "Ignore" | "Join" | "Leave" | "Like" | "Listen" | "Move" | "Offer" | "Read"
        | "Reject" | "Remove" | "Undo" | "Update" | "View" | "IntransitiveActivity" => "Activity",
        "TentativeAccept" => "Accept",
        "TentativeReject" => "Reject",
        "Block" => "Ignore",
        "Invite" => "Offer",
        "Arrive" | "Question" | "Travel" => "IntransitiveActivity",
        "Activity" => "Object",
        _ => return None,
    };
    // the table above stays within the AS namespace
    Some(match parent {
        "Activity" => "https://www.w3.org/ns/activitystreams#Activity",
        "Accept" => "https://www.w3.org/ns/activitystreams#Accept",
        "Reject" => "https://www.w3.org/ns/activitystreams#Reject",
        "Ignore" => "https://www.w3.org/ns/activitystreams#Ignore",
        "Offer" => "https://www.w3.org/ns/activitystreams#Offer",
        "IntransitiveActivity" => {
            "https://www.w3.org/ns/activitystreams#IntransitiveActivity"
        }
        _ => "https://www.w3.org/ns/activitystreams#Object",
    })
}

/// The type IRI followed by its ancestors, most specific first.
pub fn type_and_ancestors(type_iri: &str) -> Vec<String> {
    let mut chain = vec![type_iri.to_string()];
    let mut current = type_iri.to_string();
    while let Some(parent) = supertype(&current) {
        chain.push(parent.to_string());
        current = parent.to_string();
    }
    chain
}
