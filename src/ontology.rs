//! Runtime ontology: node types, mention-type inference, and predicate type
//! constraints.
//!
//! The ontology gates two different decisions. During linking it scores how
//! compatible a candidate concept's category is with the type a mention's
//! context suggests. During predicate governance it decides whether a
//! `(subject_type, predicate, object_type)` combination is allowed at all.
//! Feedback can forbid additional pairs; those take effect through a new
//! ontology value on the next build.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{OntologyConfig, TypePair};
use crate::model::Predicate;

/// Outcome of a type-compatibility check during candidate reranking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypeCompatibility {
    /// Blend this score into the rerank; 1.0 is a perfect match.
    Score(f32),
    /// The candidate's type can never co-refer with the mention's; drop it.
    HardViolation,
}

#[derive(Debug, Clone)]
pub struct Ontology {
    node_types: FxHashSet<String>,
    /// Ordered so inference is deterministic when several cues match.
    type_cues: Vec<(String, Vec<String>)>,
    constraints: FxHashMap<String, Vec<TypePair>>,
    disjoint: FxHashSet<(String, String)>,
    forbidden: FxHashSet<(String, String, String)>,
}

impl Ontology {
    pub fn from_config(config: &OntologyConfig) -> Self {
        let mut type_cues: Vec<(String, Vec<String>)> = config
            .type_cues
            .iter()
            .map(|(ty, cues)| {
                (
                    ty.clone(),
                    cues.iter().map(|c| c.to_lowercase()).collect(),
                )
            })
            .collect();
        type_cues.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut disjoint = FxHashSet::default();
        for pair in &config.disjoint {
            let a = pair.subject.to_lowercase();
            let b = pair.object.to_lowercase();
            disjoint.insert((a.clone(), b.clone()));
            disjoint.insert((b, a));
        }

        Ontology {
            node_types: config.node_types.iter().map(|t| t.to_lowercase()).collect(),
            type_cues,
            constraints: config
                .constraints
                .iter()
                .map(|c| (c.predicate.to_uppercase(), c.pairs.clone()))
                .collect(),
            disjoint,
            forbidden: FxHashSet::default(),
        }
    }

    /// Infer a mention's type from its surrounding sentence, if any cue fires.
    pub fn infer_type(&self, context: &str) -> Option<&str> {
        let lowered = context.to_lowercase();
        for (ty, cues) in &self.type_cues {
            if cues.iter().any(|cue| lowered.contains(cue.as_str())) {
                return Some(ty.as_str());
            }
        }
        None
    }

    /// Score a candidate concept's category against the mention's inferred
    /// type. Unknown on either side is neutral; disjoint pairs disqualify.
    pub fn compatibility(
        &self,
        mention_type: Option<&str>,
        concept_category: &str,
    ) -> TypeCompatibility {
        let Some(mention_type) = mention_type else {
            return TypeCompatibility::Score(0.5);
        };
        let category = concept_category.trim().to_lowercase();
        if category.is_empty() || !self.node_types.contains(&category) {
            return TypeCompatibility::Score(0.5);
        }
        let mention_type = mention_type.to_lowercase();
        if mention_type == category {
            return TypeCompatibility::Score(1.0);
        }
        if self.disjoint.contains(&(mention_type, category)) {
            return TypeCompatibility::HardViolation;
        }
        TypeCompatibility::Score(0.2)
    }

    /// Check a triple against the per-predicate `(subject_type, object_type)`
    /// constraints and the feedback-forbidden pairs.
    pub fn check_triple(
        &self,
        predicate: &Predicate,
        subject_type: &str,
        object_type: &str,
    ) -> Result<(), String> {
        let key = (
            predicate.as_str().to_string(),
            subject_type.to_lowercase(),
            object_type.to_lowercase(),
        );
        if self.forbidden.contains(&key) {
            return Err(format!(
                "{} is forbidden between {subject_type} and {object_type}",
                predicate.as_str()
            ));
        }
        let Some(pairs) = self.constraints.get(predicate.as_str()) else {
            return Ok(());
        };
        if pairs.is_empty() {
            return Ok(());
        }
        let subject = subject_type.to_lowercase();
        let object = object_type.to_lowercase();
        let allowed = pairs.iter().any(|pair| {
            pair.subject.eq_ignore_ascii_case(&subject) && pair.object.eq_ignore_ascii_case(&object)
        });
        if allowed {
            Ok(())
        } else {
            Err(format!(
                "{} does not admit ({subject_type}, {object_type})",
                predicate.as_str()
            ))
        }
    }

    /// Feedback: forbid a predicate for a concrete type pair. Takes effect
    /// for every check on this ontology value from now on; ingestions hold a
    /// snapshot, so running builds are unaffected.
    pub fn forbid(&mut self, predicate: &Predicate, subject_type: &str, object_type: &str) {
        self.forbidden.insert((
            predicate.as_str().to_string(),
            subject_type.to_lowercase(),
            object_type.to_lowercase(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OntologyConfig, PredicateConstraint};

    fn ontology() -> Ontology {
        Ontology::from_config(&OntologyConfig::default())
    }

    #[test]
    fn cues_drive_type_inference() {
        let ontology = ontology();
        assert_eq!(
            ontology.infer_type("人工智能是一种技术，应用广泛。"),
            Some("technology")
        );
        assert_eq!(ontology.infer_type("a plain sentence about nothing"), None);
    }

    #[test]
    fn matching_types_score_high_and_disjoint_disqualify() {
        let ontology = ontology();
        assert_eq!(
            ontology.compatibility(Some("technology"), "technology"),
            TypeCompatibility::Score(1.0)
        );
        assert_eq!(
            ontology.compatibility(Some("person"), "technology"),
            TypeCompatibility::HardViolation
        );
        assert_eq!(
            ontology.compatibility(None, "technology"),
            TypeCompatibility::Score(0.5)
        );
    }

    #[test]
    fn constraints_reject_unlisted_pairs() {
        let mut config = OntologyConfig::default();
        config.constraints.push(PredicateConstraint {
            predicate: "USES".to_string(),
            pairs: vec![TypePair {
                subject: "technology".to_string(),
                object: "method".to_string(),
            }],
        });
        let ontology = Ontology::from_config(&config);
        let uses = Predicate::new("USES");
        assert!(ontology.check_triple(&uses, "technology", "method").is_ok());
        assert!(ontology.check_triple(&uses, "person", "method").is_err());
    }

    #[test]
    fn feedback_forbids_take_effect() {
        let mut ontology = ontology();
        let uses = Predicate::new("USES");
        assert!(ontology.check_triple(&uses, "technology", "method").is_ok());
        ontology.forbid(&uses, "technology", "method");
        assert!(ontology.check_triple(&uses, "technology", "method").is_err());
    }
}
