//! Small helpers: message-id synthesis and wire timestamps

use chrono::Utc;
use rand::Rng;

/// Synthesize a Message-ID for a POST that arrived without one
pub fn gen_message_id(instance: &str) -> String {
    let tag: u64 = rand::thread_rng().gen();
    format!("<{}.{:x}@{}>", Utc::now().timestamp(), tag, instance)
}

/// Current UTC time in Date-header form (RFC 2822)
pub fn date_now_str() -> String {
    Utc::now().to_rfc2822()
}

/// Current unix timestamp, used as the NEWSGROUPS cutoff argument
pub fn time_now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::valid_message_id;

    #[test]
    fn test_generated_ids_are_valid_and_distinct() {
        let a = gen_message_id("newspeer.test");
        let b = gen_message_id("newspeer.test");
        assert!(valid_message_id(&a));
        assert!(valid_message_id(&b));
        assert_ne!(a, b);
        assert!(a.ends_with("@newspeer.test>"));
    }

    #[test]
    fn test_date_parses_back() {
        let date = date_now_str();
        assert!(chrono::DateTime::parse_from_rfc2822(&date).is_ok());
    }
}
