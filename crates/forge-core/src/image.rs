use forge_types::{ForgeError, Result};
use tracing::{debug, warn};

use crate::runtime::ContainerRuntime;

/// Verify `image` exists locally. Never pulls or builds.
///
/// A missing image is `ImageNotFound`; any other lookup failure is
/// `ImageCheck`.
pub async fn ensure_image(runtime: &dyn ContainerRuntime, image: &str) -> Result<()> {
    match runtime.inspect_image(image).await {
        Ok(true) => {
            debug!(image, "Image present");
            Ok(())
        }
        Ok(false) => {
            warn!(image, "Image not found on daemon");
            Err(ForgeError::ImageNotFound(image.to_string()))
        }
        Err(ForgeError::ImageCheck(msg)) => Err(ForgeError::ImageCheck(msg)),
        Err(other) => Err(ForgeError::ImageCheck(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RuntimeCall};

    #[tokio::test]
    async fn present_image_passes() {
        let rt = MockRuntime::new();
        ensure_image(&rt, "forge-cpp-runner").await.unwrap();
        assert_eq!(
            rt.calls(),
            vec![RuntimeCall::InspectImage("forge-cpp-runner".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_image_is_not_found() {
        let rt = MockRuntime::new().with_missing_image("forge-cpp-runner");
        let err = ensure_image(&rt, "forge-cpp-runner").await.unwrap_err();
        assert!(matches!(err, ForgeError::ImageNotFound(ref name) if name == "forge-cpp-runner"));
    }

    #[tokio::test]
    async fn daemon_fault_is_check_error() {
        let rt = MockRuntime::new().with_image_check_error("500 internal server error");
        let err = ensure_image(&rt, "forge-cpp-runner").await.unwrap_err();
        assert!(matches!(err, ForgeError::ImageCheck(_)));
    }

    #[tokio::test]
    async fn lookup_never_creates_anything() {
        let rt = MockRuntime::new().with_missing_image("ghost");
        let _ = ensure_image(&rt, "ghost").await;
        assert_eq!(rt.create_count(), 0);
        assert_eq!(rt.calls().len(), 1);
    }
}
