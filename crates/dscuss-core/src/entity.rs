//! The entity model: User, Message and the reserved Operation kind, with
//! their canonical big-endian wire layouts and signature binding.
//!
//! Every declared length is validated against the remaining input before any
//! buffer is sliced, so a truncated or hostile payload fails with
//! [`EntityError::Malformed`] rather than panicking or reading uninitialized
//! memory; each field is read into its own owned buffer in the order it
//! appears on the wire, so a subject length can never bleed into the text
//! that follows it.

use crate::crypto::{sha512, Hash, Keypair, PublicKey, Signature, SIGNATURE_BUF_LEN};
use crate::error::EntityError;
use crate::pow::validate as pow_validate;
use crate::topic::Topic;

/// A cursor over a byte slice that tracks consumption and never reads past
/// its end.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EntityError> {
        if n > self.remaining() {
            return Err(EntityError::Malformed(format!(
                "need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, EntityError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, EntityError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, EntityError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn hash64(&mut self) -> Result<Hash, EntityError> {
        let bytes: [u8; 64] = self.take(64)?.try_into().unwrap();
        Ok(Hash(bytes))
    }

    fn utf8(&mut self, len: usize) -> Result<String, EntityError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EntityError::Malformed(format!("invalid utf-8: {e}")))
    }

    fn signature(&mut self) -> Result<Signature, EntityError> {
        let sig_len = self.u16()?;
        let buf = self.take(SIGNATURE_BUF_LEN)?;
        if sig_len as usize > SIGNATURE_BUF_LEN {
            return Err(EntityError::Malformed("signature length exceeds buffer".into()));
        }
        Signature::from_parts(&buf[..sig_len as usize]).map_err(EntityError::from)
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn push_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}
fn push_signature(out: &mut Vec<u8>, sig: &Signature) {
    push_u16(out, sig.len());
    out.extend_from_slice(sig.wire_buf());
}

/// A registered identity: a public key gated by proof-of-work, plus
/// self-asserted nickname/info, self-signed.
#[derive(Clone)]
pub struct User {
    pub public_key: PublicKey,
    pub proof: u64,
    pub nickname: String,
    pub info: String,
    pub timestamp: i64,
    pub signature: Signature,
}

impl User {
    /// `id = sha512(der(public_key))`.
    pub fn id(&self) -> Hash {
        self.public_key.id()
    }

    /// Bytes covered by the self-signature: every field up to but not
    /// including the signature-length field.
    fn signed_prefix(
        public_key_der: &[u8],
        proof: u64,
        nickname: &str,
        info: &str,
        timestamp: i64,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 8 + 2 + 2 + 8 + public_key_der.len() + nickname.len() + info.len());
        push_u16(&mut out, public_key_der.len() as u16);
        push_u64(&mut out, proof);
        push_u16(&mut out, nickname.len() as u16);
        push_u16(&mut out, info.len() as u16);
        push_i64(&mut out, timestamp);
        out.extend_from_slice(public_key_der);
        out.extend_from_slice(nickname.as_bytes());
        out.extend_from_slice(info.as_bytes());
        out
    }

    /// Construct and self-sign a new User with the current time.
    pub fn emerge(keypair: &Keypair, proof: u64, nickname: String, info: String, timestamp: i64) -> Result<Self, EntityError> {
        if nickname.is_empty() {
            return Err(EntityError::Malformed("nickname must not be empty".into()));
        }
        let der = keypair.public().to_der();
        let prefix = Self::signed_prefix(&der, proof, &nickname, &info, timestamp);
        let signature = keypair.sign(&prefix);
        Ok(Self {
            public_key: keypair.public().clone(),
            proof,
            nickname,
            info,
            timestamp,
            signature,
        })
    }

    /// Valid iff the proof-of-work clears `required_zero_bits` and the
    /// self-signature verifies.
    pub fn is_valid(&self, required_zero_bits: u32) -> bool {
        let der = self.public_key.to_der();
        if !pow_validate(&der, self.proof, required_zero_bits) {
            return false;
        }
        let prefix = Self::signed_prefix(&der, self.proof, &self.nickname, &self.info, self.timestamp);
        self.public_key.verify(&prefix, &self.signature)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let der = self.public_key.to_der();
        let mut out = Self::signed_prefix(&der, self.proof, &self.nickname, &self.info, self.timestamp);
        push_signature(&mut out, &self.signature);
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, EntityError> {
        let mut r = Reader::new(buf);
        let pubkey_len = r.u16()? as usize;
        let proof = r.u64()?;
        let nickname_len = r.u16()? as usize;
        let info_len = r.u16()? as usize;
        let timestamp = r.i64()?;
        let pubkey_bytes = r.take(pubkey_len)?.to_vec();
        let nickname = r.utf8(nickname_len)?;
        let info = r.utf8(info_len)?;
        let signature = r.signature()?;

        let public_key = PublicKey::from_der(&pubkey_bytes)?;
        if nickname.is_empty() {
            return Err(EntityError::Malformed("nickname must not be empty".into()));
        }
        Ok(Self {
            public_key,
            proof,
            nickname,
            info,
            timestamp,
            signature,
        })
    }
}

/// A signed, topic-classified post, optionally a reply to another message.
#[derive(Clone)]
pub struct Message {
    pub topic: Topic,
    pub subject: String,
    pub content: String,
    pub timestamp: i64,
    pub author_id: Hash,
    pub parent_id: Hash,
    pub signature: Signature,
}

impl Message {
    fn canonical_prefix(
        topic: &Topic,
        subject: &str,
        content: &str,
        timestamp: i64,
        author_id: &Hash,
        parent_id: &Hash,
    ) -> Vec<u8> {
        let topic_str = topic.to_canonical_string();
        let mut out = Vec::with_capacity(
            2 + 2 + 2 + 8 + 64 + 64 + topic_str.len() + subject.len() + content.len(),
        );
        push_u16(&mut out, topic_str.len() as u16);
        push_u16(&mut out, subject.len() as u16);
        push_u16(&mut out, content.len() as u16);
        push_i64(&mut out, timestamp);
        out.extend_from_slice(author_id.as_bytes());
        out.extend_from_slice(parent_id.as_bytes());
        out.extend_from_slice(topic_str.as_bytes());
        out.extend_from_slice(subject.as_bytes());
        out.extend_from_slice(content.as_bytes());
        out
    }

    /// `id = sha512(canonical prefix)`; a pure function recomputed fresh,
    /// never cached.
    pub fn id(&self) -> Hash {
        let prefix = Self::canonical_prefix(
            &self.topic,
            &self.subject,
            &self.content,
            self.timestamp,
            &self.author_id,
            &self.parent_id,
        );
        sha512(&prefix)
    }

    /// Author a new thread-root message (`parent_id` all zero).
    pub fn new_thread(
        keypair: &Keypair,
        author_id: Hash,
        topic: Topic,
        subject: String,
        content: String,
        timestamp: i64,
    ) -> Self {
        Self::new_reply(keypair, author_id, Hash::ZERO, topic, subject, content, timestamp)
    }

    /// Author a reply to `parent_id`.
    pub fn new_reply(
        keypair: &Keypair,
        author_id: Hash,
        parent_id: Hash,
        topic: Topic,
        subject: String,
        content: String,
        timestamp: i64,
    ) -> Self {
        let prefix = Self::canonical_prefix(&topic, &subject, &content, timestamp, &author_id, &parent_id);
        let signature = keypair.sign(&prefix);
        Self {
            topic,
            subject,
            content,
            timestamp,
            author_id,
            parent_id,
            signature,
        }
    }

    /// Verify the signature under the author's public key.
    pub fn verify(&self, author_public_key: &PublicKey) -> bool {
        let prefix = Self::canonical_prefix(
            &self.topic,
            &self.subject,
            &self.content,
            self.timestamp,
            &self.author_id,
            &self.parent_id,
        );
        author_public_key.verify(&prefix, &self.signature)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Self::canonical_prefix(
            &self.topic,
            &self.subject,
            &self.content,
            self.timestamp,
            &self.author_id,
            &self.parent_id,
        );
        push_signature(&mut out, &self.signature);
        out
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, EntityError> {
        let mut r = Reader::new(buf);
        let topic_len = r.u16()? as usize;
        let subject_len = r.u16()? as usize;
        let text_len = r.u16()? as usize;
        let timestamp = r.i64()?;
        let author_id = r.hash64()?;
        let parent_id = r.hash64()?;
        let topic_str = r.utf8(topic_len)?;
        let subject = r.utf8(subject_len)?;
        let content = r.utf8(text_len)?;
        let signature = r.signature()?;

        let topic = Topic::parse(&topic_str)?;
        Ok(Self {
            topic,
            subject,
            content,
            timestamp,
            author_id,
            parent_id,
            signature,
        })
    }
}

/// Reserved entity kind: wire and schema placeholders exist, ingest is not
/// implemented.
pub struct Operation;

impl Operation {
    pub fn deserialize(_buf: &[u8]) -> Result<Self, EntityError> {
        Err(EntityError::NotImplemented)
    }
}

/// The tagged sum type replacing the single polymorphic `Entity` of the
/// original design.
pub enum Entity {
    User(User),
    Message(Message),
    Operation(Operation),
}
