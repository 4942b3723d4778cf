//! Content negotiation for GET requests to ActivityPub resources

/// Outcome of negotiating an `Accept` header against the representations an
/// AS2 resource has: the two JSON-LD flavors, or nothing we can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Negotiated {
    /// Serve `application/activity+json`.
    ActivityJson,
    /// Serve `application/ld+json` with the ActivityStreams profile.
    LdJson,
    /// The client prefers HTML or some other media we do not render.
    Unacceptable,
}

const OFFERS: [&str; 3] = [
    "application/activity+json",
    "application/ld+json",
    "text/html",
];

#[derive(Clone, Copy, PartialEq)]
struct Score {
    params_present: bool,
    specificity: u8,
    q: f32,
    position: usize,
}

impl Score {
    /// Ordering per the negotiation rules: parameters present beat absent,
    /// subtype-specific beats wildcard, higher q beats lower, earlier in the
    /// list wins ties.
    fn beats(&self, other: &Score) -> bool {
        if self.params_present != other.params_present {
            return self.params_present;
        }
        if self.specificity != other.specificity {
            return self.specificity > other.specificity;
        }
        if (self.q - other.q).abs() > f32::EPSILON {
            return self.q > other.q;
        }
        self.position < other.position
    }
}

/// Pick the representation to serve for `accept`. An absent or empty header
/// accepts anything and gets `application/activity+json`.
pub(crate) fn negotiate(accept: Option<&str>) -> Negotiated {
    let Some(accept) = accept else {
        return Negotiated::ActivityJson;
    };
    if accept.trim().is_empty() {
        return Negotiated::ActivityJson;
    }

    let ranges: Vec<MediaRange> = accept
        .split(',')
        .filter_map(|part| MediaRange::parse(part.trim()))
        .collect();
    if ranges.is_empty() {
        return Negotiated::ActivityJson;
    }

    let mut winner: Option<(&str, Score)> = None;
    for offer in OFFERS {
        let Some(score) = best_match(&ranges, offer) else {
            continue;
        };
        if score.q <= 0.0 {
            continue;
        }
        match &winner {
            Some((_, best)) if !score.beats(best) => {}
            _ => winner = Some((offer, score)),
        }
    }
    match winner {
        Some(("application/activity+json", _)) => Negotiated::ActivityJson,
        Some(("application/ld+json", _)) => Negotiated::LdJson,
        _ => Negotiated::Unacceptable,
    }
}

struct MediaRange {
    kind: String,
    subtype: String,
    q: f32,
    has_media_params: bool,
}

impl MediaRange {
    fn parse(range: &str) -> Option<MediaRange> {
        let mut parts = range.split(';');
        let essence = parts.next()?.trim();
        let (kind, subtype) = essence.split_once('/')?;
        let mut q = 1.0f32;
        let mut has_media_params = false;
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("q") {
                q = value.trim().parse().unwrap_or(0.0);
            } else {
                // Media parameters such as profile narrow the range.
                has_media_params = true;
            }
        }
        Some(MediaRange {
            kind: kind.trim().to_ascii_lowercase(),
            subtype: subtype.trim().to_ascii_lowercase(),
            q,
            has_media_params,
        })
    }

    fn matches(&self, offer: &str) -> Option<u8> {
        let (kind, subtype) = offer.split_once('/')?;
        if self.kind == "*" && self.subtype == "*" {
            return Some(0);
        }
        if self.kind == kind && self.subtype == "*" {
            return Some(1);
        }
        if self.kind == kind && self.subtype == subtype {
            return Some(2);
        }
        None
    }
}

fn best_match(ranges: &[MediaRange], offer: &str) -> Option<Score> {
    let mut best: Option<Score> = None;
    for (position, range) in ranges.iter().enumerate() {
        let Some(specificity) = range.matches(offer) else {
            continue;
        };
        let score = Score {
            params_present: range.has_media_params,
            specificity,
            q: range.q,
            position,
        };
        match &best {
            Some(current) if !score.beats(current) => {}
            _ => best = Some(score),
        }
    }
    best
}
