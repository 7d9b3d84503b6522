use data_contracts::annotation::{AnnotationRecord, ObjectLabel, ValidationError};

#[test]
fn invalid_bbox_norm_rejected() {
    let record = AnnotationRecord {
        image: "images/frame.png".into(),
        labels: vec![ObjectLabel {
            bbox_px: None,
            bbox_norm: Some([0.8, 0.2, 0.1, 0.9]),
            class_id: 1,
        }],
    };
    let err = record.validate().unwrap_err();
    assert!(matches!(err, ValidationError::InvalidBboxNorm(_)));
}

#[test]
fn background_class_rejected() {
    let record = AnnotationRecord {
        image: "images/frame.png".into(),
        labels: vec![ObjectLabel {
            bbox_px: Some([0.0, 0.0, 10.0, 10.0]),
            bbox_norm: None,
            class_id: 0,
        }],
    };
    assert!(matches!(
        record.validate(),
        Err(ValidationError::BackgroundClass(0))
    ));
}

#[test]
fn valid_bbox_passes() {
    let record = AnnotationRecord {
        image: "images/frame.png".into(),
        labels: vec![ObjectLabel {
            bbox_px: Some([0.0, 0.0, 10.0, 10.0]),
            bbox_norm: Some([0.1, 0.1, 0.2, 0.2]),
            class_id: 2,
        }],
    };
    assert!(record.validate().is_ok());
}

#[test]
fn labels_default_to_empty_in_json() {
    let record: AnnotationRecord =
        serde_json::from_str(r#"{"image": "frame.png"}"#).expect("parse record");
    assert!(record.labels.is_empty());
    assert!(record.validate().is_ok());
}
