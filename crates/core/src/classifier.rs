use crate::models::{ClassificationRecord, SourceFile};
use chrono::Utc;
use providers::{ClassificationProvider, ClassifyRequest, ProviderError, TargetSchema};

/// One provider call for one file, stamped into a record on success.
pub async fn classify_file(
    provider: &dyn ClassificationProvider,
    file: &SourceFile,
    schema: &TargetSchema,
) -> Result<ClassificationRecord, ProviderError> {
    let request = ClassifyRequest {
        path: &file.relative_path,
        project: &file.project,
        kind: file.kind,
        content: &file.content,
    };
    let classification = provider.classify(&request, schema).await?;
    Ok(ClassificationRecord::from_classification(
        file,
        provider.name(),
        classification,
        Utc::now(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileKind;
    use providers::Classification;

    struct Echo;

    #[async_trait::async_trait]
    impl ClassificationProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn classify(
            &self,
            request: &ClassifyRequest<'_>,
            _schema: &TargetSchema,
        ) -> Result<Classification, ProviderError> {
            Ok(Classification {
                purpose: format!("purpose of {}", request.path),
                rules: vec![request.kind.to_string()],
                workflows: vec![],
                integration_points: vec![request.project.to_string()],
                confidence: 0.7,
            })
        }
    }

    #[tokio::test]
    async fn record_carries_key_and_file_metadata() {
        let file = SourceFile::new(
            "Loyalty/LoyaltyRule.cs",
            "Loyalty",
            FileKind::Code,
            "class LoyaltyRule {}".into(),
        );
        let record = classify_file(&Echo, &file, &TargetSchema::default())
            .await
            .unwrap();
        assert_eq!(record.key().fingerprint, file.fingerprint);
        assert_eq!(record.provider, "echo");
        assert_eq!(record.purpose, "purpose of Loyalty/LoyaltyRule.cs");
        assert_eq!(record.rules, vec!["code"]);
        assert_eq!(record.integration_points, vec!["Loyalty"]);
        assert_eq!(record.file_kind, FileKind::Code);
    }
}
