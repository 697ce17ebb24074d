//
// Avatar artifact storage (Apache OpenDAL)
//
// When no storage root is configured the callers fall back to inline
// base64 data URLs, so avatars keep working on a bare install.
use data_encoding::BASE64;
use once_cell::sync::Lazy;
use opendal::{services, Operator};

use crate::api::ApiResult;
use crate::db::models::UserId;
use crate::CONFIG;

static OPERATOR: Lazy<Option<Operator>> = Lazy::new(|| {
    let root = CONFIG.storage_root.as_ref()?;
    match Operator::new(services::Fs::default().root(root)) {
        Ok(op) => Some(op.finish()),
        Err(e) => {
            error!("Failed to initialize avatar storage at {root}: {e}");
            None
        }
    }
});

fn avatar_key(user_id: UserId) -> String {
    format!("avatars/{user_id}")
}

/// Best-effort content sniffing for the data-URL fallback.
fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xff, 0xd8, 0xff, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "application/octet-stream",
    }
}

pub fn data_url(bytes: &[u8]) -> String {
    format!("data:{};base64,{}", sniff_image_mime(bytes), BASE64.encode(bytes))
}

/// Uploads avatar bytes and returns the public URL. Falls back to an inline
/// data URL when storage is unconfigured.
pub async fn store_avatar(user_id: UserId, bytes: Vec<u8>) -> ApiResult<String> {
    let Some(op) = OPERATOR.as_ref() else {
        return Ok(data_url(&bytes));
    };

    let key = avatar_key(user_id);
    op.write(&key, bytes).await?;

    match CONFIG.storage_public_url {
        Some(ref base) => Ok(format!("{base}/{key}")),
        None => Ok(format!("{}/{key}", CONFIG.domain)),
    }
}

/// Removes any stored artifact for this user. A missing object is fine.
pub async fn delete_avatar(user_id: UserId) -> ApiResult<()> {
    let Some(op) = OPERATOR.as_ref() else {
        return Ok(());
    };

    op.delete(&avatar_key(user_id)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_image_mime() {
        assert_eq!(sniff_image_mime(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a]), "image/png");
        assert_eq!(sniff_image_mime(&[0xff, 0xd8, 0xff, 0xe0]), "image/jpeg");
        assert_eq!(sniff_image_mime(b"GIF89a"), "image/gif");
        assert_eq!(sniff_image_mime(b"plain text"), "application/octet-stream");
    }

    #[test]
    fn test_data_url_encodes_content() {
        let url = data_url(&[0xff, 0xd8, 0xff, 0x00]);
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }
}
