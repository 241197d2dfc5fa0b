use crate::api;
use crate::models::PreviewPost;

/// What the preview pane shows for the current draft.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviewState {
    pub posts: Option<Vec<PreviewPost>>,
    pub error: Option<String>,
    pub failure: Option<String>,
    pub loading: bool,
}

impl PreviewState {
    pub fn begin(&mut self) {
        self.loading = true;
    }

    pub fn apply(&mut self, result: api::Result<Vec<PreviewPost>>) {
        self.loading = false;
        match result {
            Ok(posts) => {
                self.posts = Some(posts);
                self.error = None;
                self.failure = None;
            }
            Err(api::Error::Rejected { message }) => {
                self.posts = None;
                self.error = Some(message);
                self.failure = None;
            }
            Err(err) => {
                log::warn!("preview: request failed: {err}");
                self.failure = Some(err.to_string());
            }
        }
    }

    /// Forget everything, e.g. when switching to another feed.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_replaces_posts_and_clears_error() {
        let mut state = PreviewState {
            error: Some("old".into()),
            ..PreviewState::default()
        };
        state.begin();
        state.apply(Ok(vec![json!({"title": "a"}), json!({"title": "b"})]));
        assert!(!state.loading);
        assert_eq!(state.posts.as_ref().map(Vec::len), Some(2));
        assert!(state.error.is_none());
    }

    #[test]
    fn rejection_clears_posts_and_sets_message() {
        let mut state = PreviewState {
            posts: Some(vec![json!({})]),
            ..PreviewState::default()
        };
        state.begin();
        state.apply(Err(api::Error::rejected("m")));
        assert!(state.posts.is_none());
        assert_eq!(state.error.as_deref(), Some("m"));
        assert!(!state.is_failed());
    }

    #[test]
    fn transport_failure_keeps_posts_and_marks_failed() {
        let mut state = PreviewState {
            posts: Some(vec![json!({"title": "kept"})]),
            ..PreviewState::default()
        };
        state.begin();
        state.apply(Err(api::Error::Http {
            status: 502,
            body: "bad gateway".into(),
        }));
        assert!(!state.loading);
        assert!(state.is_failed());
        assert_eq!(state.posts.as_ref().map(Vec::len), Some(1));
        assert!(state.error.is_none());
    }
}
