use async_trait::async_trait;
use log::debug;

use super::{Error, Publisher};
use crate::image::BuildResult;
use crate::reference::Reference;

/// Fans a publish out to several publishers, one after the other.
pub struct MultiPublisher {
    publishers: Vec<Box<dyn Publisher>>,
}

impl MultiPublisher {
    pub fn new(publishers: Vec<Box<dyn Publisher>>) -> Self {
        Self { publishers }
    }

    /// Publish to every publisher in order and collect their references.
    ///
    /// The first failure stops the fan-out; publishers before it keep what they received.
    pub async fn publish_all(
        &self,
        result: &BuildResult,
        identity: &str,
    ) -> Result<Vec<Reference>, Error> {
        let mut references = Vec::with_capacity(self.publishers.len());
        for (index, publisher) in self.publishers.iter().enumerate() {
            debug!("publishing {identity} with publisher {index}");
            let reference = publisher
                .publish(result, identity)
                .await
                .map_err(|cause| Error::PublisherFailed {
                    index,
                    cause: Box::new(cause),
                })?;
            references.push(reference);
        }
        Ok(references)
    }
}

#[async_trait]
impl Publisher for MultiPublisher {
    /// The first publisher's reference; all the others must have succeeded too.
    async fn publish(&self, result: &BuildResult, identity: &str) -> Result<Reference, Error> {
        let references = self.publish_all(result, identity).await?;
        references.into_iter().next().ok_or(Error::NoPublishers)
    }

    /// Close every publisher, even after one of them fails.
    async fn close(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        for (index, publisher) in self.publishers.iter().enumerate() {
            if let Err(err) = publisher.close().await {
                errors.push((index, err));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::CloseFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::publish::tests::Recorder;
    use crate::select::tests::single;

    fn recorders(calls: &Arc<Mutex<Vec<String>>>, failing: Option<usize>) -> MultiPublisher {
        MultiPublisher::new(
            ["a", "b", "c"]
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let mut recorder = Recorder::new(name, calls);
                    recorder.fail_publish = failing == Some(i);
                    recorder.fail_close = failing == Some(i);
                    Box::new(recorder) as Box<dyn Publisher>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn publishes_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let multi = recorders(&calls, None);

        let references = multi.publish_all(&single('a'), "./cmd/app").await.unwrap();

        assert_eq!(
            references.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                "example.com/a:latest",
                "example.com/b:latest",
                "example.com/c:latest"
            ]
        );
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "publish a ./cmd/app",
                "publish b ./cmd/app",
                "publish c ./cmd/app"
            ]
        );
    }

    #[tokio::test]
    async fn returns_first_reference() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let multi = recorders(&calls, None);

        let reference = multi.publish(&single('a'), "./cmd/app").await.unwrap();

        assert_eq!(reference.to_string(), "example.com/a:latest");
    }

    #[tokio::test]
    async fn failure_stops_the_fan_out() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let multi = recorders(&calls, Some(1));

        let err = multi.publish(&single('a'), "./cmd/app").await.unwrap_err();

        assert!(matches!(err, Error::PublisherFailed { index: 1, .. }));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["publish a ./cmd/app", "publish b ./cmd/app"]
        );
    }

    #[tokio::test]
    async fn close_reaches_every_publisher() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let multi = recorders(&calls, Some(0));

        let err = multi.close().await.unwrap_err();

        match err {
            Error::CloseFailed(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*calls.lock().unwrap(), vec!["close a", "close b", "close c"]);
    }

    #[tokio::test]
    async fn empty_fan_out_has_no_reference() {
        let multi = MultiPublisher::new(vec![]);
        let err = multi.publish(&single('a'), "x").await.unwrap_err();
        assert!(matches!(err, Error::NoPublishers));
    }
}
